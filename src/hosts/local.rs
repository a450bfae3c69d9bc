//! Host backed by the local machine
//!
//! Useful for single-box smoke runs and for exercising the orchestration
//! without any remote infrastructure. Commands run through `/bin/sh -c`.

use crate::error::{AeroBenchError, Result};
use crate::hosts::{truncate_output, Host};
use crate::models::{ExecutionResult, HostConfig, TaskStatus, MAX_COMMAND_LEN, MAX_OUTPUT_SIZE};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LocalHost {
    name: String,
    internal_ip: String,
    workdir: Option<PathBuf>,
}

impl LocalHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal_ip: "127.0.0.1".to_string(),
            workdir: None,
        }
    }

    /// Run commands and resolve relative file paths inside `workdir`
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            name: config.name.clone(),
            internal_ip: config
                .internal_ip
                .clone()
                .unwrap_or_else(|| config.address.clone()),
            workdir: config.workdir.as_ref().map(PathBuf::from),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.workdir {
            Some(dir) if Path::new(path).is_relative() => dir.join(path),
            _ => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn internal_ip(&self) -> String {
        self.internal_ip.clone()
    }

    async fn remote_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(AeroBenchError::Validation(format!(
                "command exceeds maximum length of {} bytes",
                MAX_COMMAND_LEN
            )));
        }

        info!(host = %self.name, "Running: {}", command);
        let start = std::time::Instant::now();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // The child is killed when the output future is dropped on cancellation
        cmd.kill_on_drop(true);

        let output = tokio::select! {
            output = cmd.output() => output?,
            _ = cancel.cancelled() => {
                warn!(host = %self.name, "Command cancelled: {}", command);
                return Err(AeroBenchError::Cancelled);
            }
        };

        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);
        let output_truncated = stdout_truncated || stderr_truncated;
        if output_truncated {
            debug!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }

        let status = if output.status.success() {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        debug!(host = %self.name, exit_code = ?output.status.code(), "Command finished with status {}", status);

        Ok(ExecutionResult {
            status,
            stdout,
            stderr,
            exit_code: output.status.code(),
            duration: start.elapsed(),
            output_truncated,
        })
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(host = %self.name, path = %target.display(), "Writing {} bytes", contents.len());
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }
}
