//! Hosts the benchmark runs on, and the groups they are organised in

pub mod local;
pub mod ssh;

use crate::error::{AeroBenchError, Result};
use crate::fanout::Target;
use crate::models::{ConnectionKind, ExecutionResult, HostConfig, MAX_OUTPUT_SIZE};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A machine that can run commands for the benchmark
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Host: Send + Sync {
    /// Inventory name, used in logs and failure reports
    fn name(&self) -> String;

    /// Address other hosts in the cluster use to reach this one
    fn internal_ip(&self) -> String;

    /// Run a shell command. A non-zero exit is reported in the result, not as an error.
    async fn remote_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Create or replace a file on the host
    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;
}

pub type HostRef = Arc<dyn Host>;

impl Target for dyn Host {
    fn label(&self) -> String {
        self.name()
    }
}

/// Run a command and turn a non-zero exit into [`AeroBenchError::CommandFailed`]
pub async fn run_checked(
    host: &dyn Host,
    command: &str,
    cancel: &CancellationToken,
) -> Result<ExecutionResult> {
    let result = host.remote_command(command, cancel).await?;
    if result.success() {
        Ok(result)
    } else {
        Err(AeroBenchError::CommandFailed {
            host: host.name(),
            command: command.to_string(),
            exit_code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        })
    }
}

/// Total memory of the host in kB, read from /proc/meminfo
pub async fn total_memory_kb(host: &dyn Host, cancel: &CancellationToken) -> Result<u64> {
    let result = run_checked(host, "grep MemTotal /proc/meminfo", cancel).await?;
    parse_mem_total(&result.stdout).ok_or_else(|| {
        AeroBenchError::Other(format!(
            "could not read MemTotal on {}: {:?}",
            host.name(),
            result.stdout.trim()
        ))
    })
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// Truncate output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };
    (String::from_utf8_lossy(bytes).to_string(), truncated)
}

/// Build a host from its inventory entry
pub fn build_host(config: &HostConfig) -> Result<HostRef> {
    debug!(host = %config.name, kind = ?config.connection, "Building host");
    match config.connection {
        ConnectionKind::Local => Ok(Arc::new(local::LocalHost::from_config(config))),
        ConnectionKind::Ssh => Ok(Arc::new(ssh::SshHost::new(config.clone())?)),
    }
}

/// Named groups of hosts, e.g. `workers` and `clients`
#[derive(Clone, Default)]
pub struct VmGroups {
    groups: BTreeMap<String, Vec<HostRef>>,
}

impl VmGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, hosts: Vec<HostRef>) {
        self.groups.insert(name.into(), hosts);
    }

    pub fn with_group(mut self, name: impl Into<String>, hosts: Vec<HostRef>) -> Self {
        self.insert(name, hosts);
        self
    }

    /// Hosts of a group; missing groups read as empty
    pub fn get(&self, name: &str) -> &[HostRef] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hosts of a group that must exist and be non-empty
    pub fn require(&self, name: &str) -> Result<&[HostRef]> {
        match self.groups.get(name) {
            Some(hosts) if !hosts.is_empty() => Ok(hosts),
            _ => Err(AeroBenchError::EmptyGroup(name.to_string())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Build every group from inventory entries
    pub fn from_inventory<'a>(
        inventory: impl IntoIterator<Item = (&'a str, &'a [HostConfig])>,
    ) -> Result<Self> {
        let mut groups = Self::new();
        for (name, hosts) in inventory {
            let built = hosts.iter().map(build_host).collect::<Result<Vec<_>>>()?;
            groups.insert(name, built);
        }
        Ok(groups)
    }
}

impl std::fmt::Debug for VmGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, hosts) in &self.groups {
            let names: Vec<_> = hosts.iter().map(|h| h.name()).collect();
            map.entry(name, &names);
        }
        map.finish()
    }
}

/// Scripted [`MockHost`]s for package-step tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::TaskStatus;
    use std::sync::Mutex;
    use std::time::Duration;

    pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            status: if exit_code == 0 {
                TaskStatus::Success
            } else {
                TaskStatus::Failed
            },
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
            duration: Duration::from_millis(1),
            output_truncated: false,
        }
    }

    /// Everything a scripted host was asked to do
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub commands: Arc<Mutex<Vec<String>>>,
        pub files: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Recorder {
        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub fn files(&self) -> Vec<(String, String)> {
            self.files.lock().unwrap().clone()
        }
    }

    /// A mock host that answers every command through `respond`
    pub fn scripted<F>(name: &str, ip: &str, respond: F) -> (MockHost, Recorder)
    where
        F: Fn(&str) -> ExecutionResult + Send + Sync + 'static,
    {
        let recorder = Recorder::default();
        let mut host = MockHost::new();
        host.expect_name().return_const(name.to_string());
        host.expect_internal_ip().return_const(ip.to_string());

        let commands = recorder.commands.clone();
        host.expect_remote_command().returning(move |cmd, _| {
            commands.lock().unwrap().push(cmd.to_string());
            Ok(respond(cmd))
        });

        let files = recorder.files.clone();
        host.expect_write_file().returning(move |path, contents| {
            files
                .lock()
                .unwrap()
                .push((path.to_string(), contents.to_string()));
            Ok(())
        });

        (host, recorder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stdout: &str) -> ExecutionResult {
        testing::output(exit_code, stdout, "oops\n")
    }

    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:  100 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16_318_480));
        assert_eq!(parse_mem_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_run_checked_maps_nonzero_exit() {
        let mut host = MockHost::new();
        host.expect_name().return_const("worker-0".to_string());
        host.expect_remote_command()
            .returning(|_, _| Ok(result(3, "")));

        let err = run_checked(&host, "false", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AeroBenchError::CommandFailed {
                host,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(host, "worker-0");
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_total_memory_kb_reads_meminfo() {
        let mut host = MockHost::new();
        host.expect_name().return_const("worker-0".to_string());
        host.expect_remote_command()
            .withf(|cmd, _| cmd.contains("/proc/meminfo"))
            .returning(|_, _| Ok(result(0, "MemTotal:        2048000 kB\n")));

        let kb = total_memory_kb(&host, &CancellationToken::new()).await.unwrap();
        assert_eq!(kb, 2_048_000);
    }

    #[test]
    fn test_require_rejects_empty_groups() {
        let groups = VmGroups::new().with_group("workers", Vec::new());
        assert!(matches!(
            groups.require("workers"),
            Err(AeroBenchError::EmptyGroup(name)) if name == "workers"
        ));
        assert!(groups.require("clients").is_err());
        assert!(groups.get("clients").is_empty());
    }

    #[test]
    fn test_from_inventory_builds_local_hosts() {
        let hosts = vec![HostConfig {
            name: "local-0".to_string(),
            address: "127.0.0.1".to_string(),
            internal_ip: None,
            user: "me".to_string(),
            port: None,
            key_path: None,
            connection: ConnectionKind::Local,
            workdir: None,
        }];
        let groups = VmGroups::from_inventory([("clients", hosts.as_slice())]).unwrap();
        let clients = groups.require("clients").unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name(), "local-0");
        assert_eq!(clients[0].label(), "local-0");
    }

    #[test]
    fn test_truncate_output() {
        let (output, truncated) = truncate_output(b"hello");
        assert_eq!(output, "hello");
        assert!(!truncated);

        let large = vec![b'x'; MAX_OUTPUT_SIZE + 10];
        let (output, truncated) = truncate_output(&large);
        assert_eq!(output.len(), MAX_OUTPUT_SIZE);
        assert!(truncated);
    }
}
