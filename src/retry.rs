//! Retry with exponential backoff for flaky host operations
//!
//! The fan-out executor never retries on its own. Individual actions opt in,
//! e.g. package installs that race with unattended apt upgrades, or polling
//! a freshly started server until it answers.
//!
//! # Example
//!
//! ```no_run
//! use aerobench::retry::{retry_with_backoff, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> aerobench::error::Result<()> {
//! let cancel = CancellationToken::new();
//! let value = retry_with_backoff(&RetryConfig::default(), "probe", &cancel, || async {
//!     Ok::<_, aerobench::error::AeroBenchError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{AeroBenchError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Settings for waiting on a service that is still starting
    pub fn polling(max_retries: u32, interval: Duration) -> Self {
        Self::new(max_retries, interval, interval)
    }
}

impl Default for RetryConfig {
    /// 3 retries, 1s base, 60s max
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Retry bookkeeping for a single operation
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1)
    pub attempt: u32,
    /// Retries performed so far
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.retry_count < config.max_retries
    }

    /// delay = base_delay * 2^retry_count, capped at max_delay
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let factor = 2u32.saturating_pow(self.retry_count.min(31));
        config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(config.max_delay)
            .min(config.max_delay)
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `op` until it succeeds, retries run out, or `cancel` fires.
///
/// [`AeroBenchError::Cancelled`] from the operation is never retried.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new();

    loop {
        if cancel.is_cancelled() {
            return Err(AeroBenchError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(AeroBenchError::Cancelled) => return Err(AeroBenchError::Cancelled),
            Err(e) => e,
        };

        if !state.should_retry(config) {
            return Err(AeroBenchError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: state.attempt,
                last_error: err.to_string(),
            });
        }

        let delay = state.calculate_delay(config);
        warn!(
            "'{}' failed (attempt {}/{}), retrying in {:?}: {}",
            operation,
            state.attempt,
            config.max_retries + 1,
            delay,
            err
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(AeroBenchError::Cancelled),
        }
        state.record_retry();
        debug!("Retrying '{}' (attempt {})", operation, state.attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_delay_doubles_and_caps() {
        let config = RetryConfig::new(10, Duration::from_millis(250), Duration::from_secs(2));
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(250));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(500));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(1));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(2));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(2));
    }

    #[test]
    fn test_overflow_protection() {
        let config = RetryConfig::new(100, Duration::from_secs(1), Duration::from_secs(3600));
        let mut state = RetryState::new();
        state.retry_count = 100;
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(3600));
    }

    #[test]
    fn test_polling_config_has_constant_delay() {
        let config = RetryConfig::polling(5, Duration::from_secs(2));
        let mut state = RetryState::new();
        state.record_retry();
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = retry_with_backoff(&fast(3), "flaky", &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AeroBenchError::Other("not yet".to_string()))
                } else {
                    Ok("ready")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_error() {
        let err = retry_with_backoff(&fast(2), "apt-get", &CancellationToken::new(), || async {
            Err::<(), _>(AeroBenchError::Other("dpkg lock held".to_string()))
        })
        .await
        .unwrap_err();

        match err {
            AeroBenchError::RetriesExhausted {
                operation,
                attempts,
                last_error,
            } => {
                assert_eq!(operation, "apt-get");
                assert_eq!(attempts, 3);
                assert!(last_error.contains("dpkg lock held"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_operation_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = retry_with_backoff(&fast(5), "probe", &CancellationToken::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AeroBenchError::Cancelled) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AeroBenchError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let config = RetryConfig::new(5, Duration::from_secs(30), Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let err = retry_with_backoff(&config, "slow", &cancel, || async {
            Err::<(), _>(AeroBenchError::Other("down".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AeroBenchError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
