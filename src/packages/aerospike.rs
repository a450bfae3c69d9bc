//! Aerospike server: build from source, configure, start and stop
//!
//! Each worker builds the server from a tagged git checkout, gets an
//! `aerospike.conf` whose heartbeat mesh lists every worker as a seed, and
//! is started with `make start`. Start-up is confirmed by polling `asinfo`.

use crate::config::validate_install_dir;
use crate::error::{AeroBenchError, Result};
use crate::hosts::{run_checked, total_memory_kb, Host};
use crate::models::{AerospikeConfig, StorageType};
use crate::packages::{apt_install, install_retry};
use crate::retry::{retry_with_backoff, RetryConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const GIT_REPO: &str = "https://github.com/aerospike/aerospike-server.git";

/// Port the heartbeat mesh listens on
pub const HEARTBEAT_PORT: u16 = 3002;
pub const SERVICE_PORT: u16 = 3000;
const FABRIC_PORT: u16 = 3001;
const INFO_PORT: u16 = 3003;

const BUILD_PACKAGES: &[&str] = &[
    "build-essential",
    "autoconf",
    "libtool",
    "git",
    "lua5.1",
    "liblua5.1-dev",
    "libssl-dev",
];

/// Poll `asinfo` every 2s for up to a minute
fn startup_poll() -> RetryConfig {
    RetryConfig::polling(30, Duration::from_secs(2))
}

/// Path of the rendered server config inside the source tree
pub fn config_path(config: &AerospikeConfig) -> String {
    format!("{}/as/etc/aerospike_dev.conf", config.install_dir)
}

/// Memory handed to the namespace, in kB
pub fn memory_size_kb(total_memory_kb: u64, fraction: f64) -> u64 {
    (total_memory_kb as f64 * fraction) as u64
}

/// Build prerequisites, clone the configured tag and compile
pub async fn install(
    host: &dyn Host,
    config: &AerospikeConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(host = %host.name(), version = %config.version, "Installing Aerospike server");
    apt_install(host, BUILD_PACKAGES, cancel).await?;

    let clone = format!(
        "rm -rf {dir} && git clone --branch {tag} --depth 1 {repo} {dir}",
        dir = config.install_dir,
        tag = config.version,
        repo = GIT_REPO
    );
    let clone = clone.as_str();
    let operation = format!("git clone on {}", host.name());
    retry_with_backoff(&install_retry(), &operation, cancel, || {
        run_checked(host, clone, cancel)
    })
    .await?;

    run_checked(
        host,
        &format!(
            "cd {} && git submodule update --init && make",
            config.install_dir
        ),
        cancel,
    )
    .await?;
    Ok(())
}

/// Render `aerospike.conf` for one server
pub fn render_config(config: &AerospikeConfig, seed_ips: &[String], memory_size_kb: u64) -> String {
    let seeds: String = seed_ips
        .iter()
        .map(|ip| format!("        mesh-seed-address-port {} {}\n", ip, HEARTBEAT_PORT))
        .collect();

    let storage = match config.storage_type {
        StorageType::Memory => "    storage-engine memory\n".to_string(),
        StorageType::Disk => {
            let devices: String = config
                .devices
                .iter()
                .map(|device| format!("        device {}\n", device))
                .collect();
            format!(
                "    storage-engine device {{\n{}        write-block-size 128K\n    }}\n",
                devices
            )
        }
    };

    format!(
        r#"service {{
    paxos-single-replica-limit 1
    pidfile {dir}/var/run/aerospike.pid
    service-threads {service_threads}
    transaction-queues {service_threads}
    transaction-threads-per-queue {transaction_threads}
    proto-fd-max 15000
    work-directory {dir}/var
}}

logging {{
    file {dir}/var/log/aerospike.log {{
        context any info
    }}
}}

network {{
    service {{
        address any
        port {service_port}
    }}
    heartbeat {{
        mode mesh
        port {heartbeat_port}
{seeds}        interval 150
        timeout 10
    }}
    fabric {{
        port {fabric_port}
    }}
    info {{
        port {info_port}
    }}
}}

namespace {namespace} {{
    replication-factor {replication_factor}
    memory-size {memory_size_kb}K
    default-ttl 30d
{storage}}}
"#,
        dir = config.install_dir,
        service_threads = config.service_threads,
        transaction_threads = config.transaction_threads_per_queue,
        service_port = SERVICE_PORT,
        heartbeat_port = HEARTBEAT_PORT,
        seeds = seeds,
        fabric_port = FABRIC_PORT,
        info_port = INFO_PORT,
        namespace = config.namespace,
        replication_factor = config.replication_factor,
        memory_size_kb = memory_size_kb,
        storage = storage,
    )
}

/// Install, configure and start the server, then wait until it answers
///
/// An empty `seed_ips` makes the server its own only seed.
pub async fn configure_and_start(
    host: &dyn Host,
    config: &AerospikeConfig,
    seed_ips: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    install(host, config, cancel).await?;

    let seeds = if seed_ips.is_empty() {
        vec![host.internal_ip()]
    } else {
        seed_ips.to_vec()
    };
    let memory_kb = memory_size_kb(total_memory_kb(host, cancel).await?, config.memory_fraction);
    let conf = render_config(config, &seeds, memory_kb);
    host.write_file(&config_path(config), &conf).await?;

    if config.storage_type == StorageType::Disk {
        // Raw devices must not be mounted while the server owns them
        for device in &config.devices {
            run_checked(host, &format!("sudo umount {} || true", device), cancel).await?;
        }
    }

    let dir = &config.install_dir;
    run_checked(host, &format!("cd {} && sudo make init", dir), cancel).await?;
    run_checked(
        host,
        &format!("cd {}; nohup sudo make start > /dev/null 2>&1 &", dir),
        cancel,
    )
    .await?;

    wait_for_up(host, &startup_poll(), cancel).await?;
    info!(host = %host.name(), seeds = seeds.len(), "Aerospike server is up");
    Ok(())
}

/// Poll `asinfo -v STATUS` until the server reports `ok`
pub async fn wait_for_up(
    host: &dyn Host,
    poll: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let operation = format!("aerospike startup on {}", host.name());
    retry_with_backoff(poll, &operation, cancel, move || async move {
        let result = host.remote_command("asinfo -v STATUS", cancel).await?;
        if result.success() && result.stdout.trim() == "ok" {
            Ok(())
        } else {
            Err(AeroBenchError::Other(format!(
                "server not ready: {}",
                result.stdout.trim()
            )))
        }
    })
    .await
}

/// Stop the server and remove its installation
pub async fn stop(
    host: &dyn Host,
    config: &AerospikeConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let dir = &config.install_dir;
    validate_install_dir("aerospike.install_dir", dir)?;
    info!(host = %host.name(), "Stopping Aerospike server");
    run_checked(host, &format!("cd {} && nohup sudo make stop", dir), cancel).await?;
    run_checked(host, &format!("sudo rm -rf {}*", dir), cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::testing::{output, scripted};

    fn seeds() -> Vec<String> {
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
    }

    fn healthy(cmd: &str) -> crate::models::ExecutionResult {
        if cmd.contains("MemTotal") {
            output(0, "MemTotal:       1000000 kB\n", "")
        } else if cmd.starts_with("asinfo") {
            output(0, "ok\n", "")
        } else {
            output(0, "", "")
        }
    }

    #[test]
    fn test_render_memory_namespace() {
        let config = AerospikeConfig::default();
        let conf = render_config(&config, &seeds(), 800_000);

        assert!(conf.contains("service-threads 4"));
        assert!(conf.contains("transaction-threads-per-queue 4"));
        assert!(conf.contains("mesh-seed-address-port 10.0.0.1 3002"));
        assert!(conf.contains("mesh-seed-address-port 10.0.0.2 3002"));
        assert!(conf.contains("namespace test {"));
        assert!(conf.contains("replication-factor 1"));
        assert!(conf.contains("memory-size 800000K"));
        assert!(conf.contains("storage-engine memory"));
        assert!(!conf.contains("storage-engine device"));
    }

    #[test]
    fn test_render_device_storage() {
        let config = AerospikeConfig {
            storage_type: StorageType::Disk,
            devices: vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()],
            replication_factor: 2,
            ..Default::default()
        };
        let conf = render_config(&config, &seeds(), 1);

        assert!(conf.contains("storage-engine device {"));
        assert!(conf.contains("device /dev/sdb"));
        assert!(conf.contains("device /dev/sdc"));
        assert!(conf.contains("replication-factor 2"));
    }

    #[test]
    fn test_memory_size_truncates() {
        assert_eq!(memory_size_kb(1_000_001, 0.8), 800_000);
        assert_eq!(memory_size_kb(0, 0.8), 0);
    }

    #[tokio::test]
    async fn test_configure_and_start_sequence() {
        let (host, recorder) = scripted("w0", "10.0.0.1", healthy);
        configure_and_start(
            &host,
            &AerospikeConfig::default(),
            &seeds(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let commands = recorder.commands();
        let position = |needle: &str| {
            commands
                .iter()
                .position(|c| c.contains(needle))
                .unwrap_or_else(|| panic!("missing command: {}", needle))
        };
        assert!(position("apt-get install") < position("git clone"));
        assert!(position("git clone --branch 4.0.0.1") < position("&& make"));
        assert!(position("&& make") < position("make init"));
        assert!(position("make init") < position("make start"));
        assert!(position("make start") < position("asinfo -v STATUS"));

        let files = recorder.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "aerospike/as/etc/aerospike_dev.conf");
        assert!(files[0].1.contains("memory-size 800000K"));
        assert!(files[0].1.contains("mesh-seed-address-port 10.0.0.2 3002"));
    }

    #[tokio::test]
    async fn test_empty_seed_list_uses_own_address() {
        let (host, recorder) = scripted("w0", "10.9.9.9", healthy);
        configure_and_start(&host, &AerospikeConfig::default(), &[], &CancellationToken::new())
            .await
            .unwrap();

        let files = recorder.files();
        assert!(files[0].1.contains("mesh-seed-address-port 10.9.9.9 3002"));
    }

    #[tokio::test]
    async fn test_build_failure_stops_before_start() {
        let (host, recorder) = scripted("w0", "10.0.0.1", |cmd| {
            if cmd.ends_with("&& make") {
                output(2, "", "make: *** [all] Error 2\n")
            } else {
                healthy(cmd)
            }
        });

        let err = configure_and_start(
            &host,
            &AerospikeConfig::default(),
            &seeds(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AeroBenchError::CommandFailed { exit_code: Some(2), .. }));
        assert!(!recorder.commands().iter().any(|c| c.contains("make start")));
        assert!(recorder.files().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_up_gives_up() {
        let (host, recorder) = scripted("w0", "10.0.0.1", |_| output(0, "starting\n", ""));
        let poll = RetryConfig::polling(2, Duration::from_millis(1));

        let err = wait_for_up(&host, &poll, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AeroBenchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(recorder.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_stop_commands() {
        let (host, recorder) = scripted("w0", "10.0.0.1", |_| output(0, "", ""));
        stop(&host, &AerospikeConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            recorder.commands(),
            vec![
                "cd aerospike && nohup sudo make stop".to_string(),
                "sudo rm -rf aerospike*".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_refuses_unsafe_install_dir() {
        let (host, recorder) = scripted("w0", "10.0.0.1", |_| output(0, "", ""));
        let config = AerospikeConfig {
            install_dir: String::new(),
            ..Default::default()
        };

        let err = stop(&host, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AeroBenchError::Validation(_)));
        assert!(recorder.commands().is_empty());
    }
}
