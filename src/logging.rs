//! Structured logging setup for the benchmark driver
//!
//! `--log-level` applies to aerobench itself; dependencies only log warnings.
//! Setting `AEROBENCH_LOG` (an `EnvFilter` directive string such as
//! `aerobench::hosts=trace,info`) replaces both.

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a full filter directive
pub const LOG_ENV: &str = "AEROBENCH_LOG";

/// Verbosity accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Output encoding for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for collecting runs from many hosts
    Json,
    /// Human readable output for interactive runs
    Pretty,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}

/// Filter directive for a command-line level
fn default_directive(level: LogLevel) -> String {
    let level = Level::from(level).to_string().to_lowercase();
    format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level)
}

fn build_filter(config: &LogConfig, env_override: Option<String>) -> anyhow::Result<EnvFilter> {
    let directive = env_override
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default_directive(config.level));
    Ok(EnvFilter::try_new(&directive)?)
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr so that reports printed on stdout stay machine readable.
/// Span close events are emitted, which gives each fan-out phase a timing line;
/// JSON lines also carry the enclosing `fanout` span so every host's output
/// can be traced back to its phase.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = build_filter(config, std::env::var(LOG_ENV).ok())?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);

    match config.format {
        LogFormat::Json => {
            let subscriber = builder
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = builder.with_target(false).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}
