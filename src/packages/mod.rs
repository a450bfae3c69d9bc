//! Software installed on the benchmark hosts

pub mod aerospike;
pub mod ycsb;

use crate::error::Result;
use crate::hosts::{run_checked, Host};
use crate::retry::{retry_with_backoff, RetryConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry budget for package-manager and download commands
pub(crate) fn install_retry() -> RetryConfig {
    RetryConfig::new(3, Duration::from_secs(5), Duration::from_secs(60))
}

/// Install distribution packages, retrying while apt is busy
pub async fn apt_install(
    host: &dyn Host,
    packages: &[&str],
    cancel: &CancellationToken,
) -> Result<()> {
    let command = format!(
        "sudo apt-get update && sudo DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
        packages.join(" ")
    );
    let command = command.as_str();
    let operation = format!("apt-get install on {}", host.name());
    retry_with_backoff(&install_retry(), &operation, cancel, || {
        run_checked(host, command, cancel)
    })
    .await?;
    Ok(())
}
