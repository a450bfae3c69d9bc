//! Host reached over SSH
//!
//! - **Key-based authentication only** (no password support)
//! - One session per command; sessions are not pooled
//! - `ssh2` is blocking, so all session work runs on tokio's blocking pool
//!
//! # Cancellation
//!
//! The token is checked before connecting, before the handshake and before
//! authentication. The session timeout is lowered once the command is running so that the
//! blocking read loop wakes up regularly and can observe the cancellation
//! token. On cancellation the channel is closed and
//! [`AeroBenchError::Cancelled`] is returned.

use crate::error::{AeroBenchError, Result};
use crate::hosts::{truncate_output, Host};
use crate::models::{ExecutionResult, HostConfig, TaskStatus, MAX_COMMAND_LEN, MAX_HOST_NAME_LEN, MAX_OUTPUT_SIZE};
use async_trait::async_trait;
use ssh2::Session;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Session timeout during connect, handshake and authentication
const HANDSHAKE_TIMEOUT_MS: u32 = 30_000;
/// Session timeout while streaming output; bounds cancellation latency
const POLL_TIMEOUT_MS: u32 = 500;

#[derive(Debug, Clone)]
pub struct SshHost {
    config: HostConfig,
}

impl SshHost {
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::validate_config(&config)?;
        Ok(Self { config })
    }

    fn validate_config(config: &HostConfig) -> Result<()> {
        if config.name.is_empty() || config.name.len() > MAX_HOST_NAME_LEN {
            return Err(AeroBenchError::Validation(format!(
                "host name must be 1-{} characters",
                MAX_HOST_NAME_LEN
            )));
        }

        if config.address.is_empty() {
            return Err(AeroBenchError::Validation(format!(
                "SSH address for '{}' cannot be empty",
                config.name
            )));
        }

        if config.user.is_empty() {
            return Err(AeroBenchError::Validation(format!(
                "SSH user for '{}' cannot be empty",
                config.name
            )));
        }

        if let Some(key_path) = &config.key_path {
            if !Path::new(key_path).exists() {
                return Err(AeroBenchError::Validation(format!(
                    "SSH key file not found: {}",
                    key_path
                )));
            }
        }

        Ok(())
    }

    /// Connect and authenticate; the token is checked between each blocking step
    fn create_session(config: &HostConfig, cancel: &CancellationToken) -> Result<Session> {
        let port = config.port.unwrap_or(DEFAULT_SSH_PORT);
        let addr = (config.address.as_str(), port)
            .to_socket_addrs()
            .map_err(ssh_err(&config.name, "failed to resolve address"))?
            .next()
            .ok_or_else(|| AeroBenchError::Ssh {
                host: config.name.clone(),
                message: format!("no address found for {}", config.address),
            })?;

        debug!(host = %config.name, %addr, "Creating SSH session");

        ensure_not_cancelled(cancel)?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(ssh_err(&config.name, "failed to connect"))?;

        let mut session = Session::new().map_err(ssh_err(&config.name, "failed to create session"))?;
        session.set_timeout(HANDSHAKE_TIMEOUT_MS);
        session.set_tcp_stream(tcp);
        ensure_not_cancelled(cancel)?;
        session
            .handshake()
            .map_err(ssh_err(&config.name, "handshake failed"))?;

        let default_key = std::env::var("HOME")
            .ok()
            .map(|home| format!("{}/.ssh/id_rsa", home));
        let key_path = config
            .key_path
            .as_ref()
            .or(default_key.as_ref())
            .ok_or_else(|| AeroBenchError::Ssh {
                host: config.name.clone(),
                message: "no SSH key path specified and HOME is not set".to_string(),
            })?;

        ensure_not_cancelled(cancel)?;
        session
            .userauth_pubkey_file(&config.user, None, Path::new(key_path), None)
            .map_err(ssh_err(&config.name, "authentication failed"))?;

        if !session.authenticated() {
            return Err(AeroBenchError::Ssh {
                host: config.name.clone(),
                message: "authentication failed".to_string(),
            });
        }

        info!(host = %config.name, %addr, "SSH session established");
        Ok(session)
    }

    fn execute_blocking(
        config: &HostConfig,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let session = Self::create_session(config, cancel)?;

        let mut channel = session
            .channel_session()
            .map_err(ssh_err(&config.name, "failed to open channel"))?;
        channel
            .exec(command)
            .map_err(ssh_err(&config.name, "failed to execute command"))?;

        session.set_timeout(POLL_TIMEOUT_MS);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; 16 * 1024];

        loop {
            if cancel.is_cancelled() {
                warn!(host = %config.name, "Cancelling remote command: {}", command);
                let _ = channel.close();
                return Err(AeroBenchError::Cancelled);
            }

            let out = read_chunk(&mut channel, &mut buf, &config.name)?;
            append_capped(&mut stdout, &buf[..out]);
            let err = read_chunk(&mut channel.stderr(), &mut buf, &config.name)?;
            append_capped(&mut stderr, &buf[..err]);

            if out == 0 && err == 0 && channel.eof() {
                break;
            }
        }

        session.set_timeout(HANDSHAKE_TIMEOUT_MS);
        channel
            .wait_close()
            .map_err(ssh_err(&config.name, "failed to close channel"))?;
        let exit_code = channel
            .exit_status()
            .map_err(ssh_err(&config.name, "failed to read exit status"))?;

        let (stdout, stdout_truncated) = truncate_output(&stdout);
        let (stderr, stderr_truncated) = truncate_output(&stderr);
        let output_truncated = stdout_truncated || stderr_truncated;
        if output_truncated {
            warn!(host = %config.name, "Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }

        let status = if exit_code == 0 {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        debug!(host = %config.name, exit_code, "Remote command finished with status {}", status);

        Ok(ExecutionResult {
            status,
            stdout,
            stderr,
            exit_code: Some(exit_code),
            duration: start.elapsed(),
            output_truncated,
        })
    }

    fn upload_blocking(config: &HostConfig, path: &str, contents: &str) -> Result<()> {
        let session = Self::create_session(config, &CancellationToken::new())?;
        let mut remote = session
            .scp_send(Path::new(path), 0o644, contents.len() as u64, None)
            .map_err(ssh_err(&config.name, "failed to start upload"))?;
        remote
            .write_all(contents.as_bytes())
            .map_err(ssh_err(&config.name, "failed to write file"))?;
        remote.send_eof().map_err(ssh_err(&config.name, "upload EOF failed"))?;
        remote.wait_eof().map_err(ssh_err(&config.name, "upload EOF failed"))?;
        remote.close().map_err(ssh_err(&config.name, "upload close failed"))?;
        remote
            .wait_close()
            .map_err(ssh_err(&config.name, "upload close failed"))?;
        Ok(())
    }
}

#[async_trait]
impl Host for SshHost {
    fn name(&self) -> String {
        self.config.name.clone()
    }

    fn internal_ip(&self) -> String {
        self.config
            .internal_ip
            .clone()
            .unwrap_or_else(|| self.config.address.clone())
    }

    async fn remote_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if command.is_empty() || command.len() > MAX_COMMAND_LEN {
            return Err(AeroBenchError::Validation(format!(
                "SSH command must be 1-{} bytes",
                MAX_COMMAND_LEN
            )));
        }

        ensure_not_cancelled(cancel)?;
        info!(host = %self.config.name, "Running over SSH: {}", command);

        let config = self.config.clone();
        let command = command.to_string();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || Self::execute_blocking(&config, &command, &cancel))
            .await
            .map_err(|e| AeroBenchError::Other(format!("SSH worker join error: {}", e)))?
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        debug!(host = %self.config.name, path, "Uploading {} bytes", contents.len());
        let config = self.config.clone();
        let path = path.to_string();
        let contents = contents.to_string();
        tokio::task::spawn_blocking(move || Self::upload_blocking(&config, &path, &contents))
            .await
            .map_err(|e| AeroBenchError::Other(format!("SSH worker join error: {}", e)))?
    }
}

/// Read whatever is available; a poll timeout counts as zero bytes
fn read_chunk(reader: &mut impl Read, buf: &mut [u8], host: &str) -> Result<usize> {
    match reader.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
        Err(e) => Err(AeroBenchError::Ssh {
            host: host.to_string(),
            message: format!("failed to read output: {}", e),
        }),
    }
}

fn append_capped(out: &mut Vec<u8>, chunk: &[u8]) {
    // One byte past the cap so truncation is still detected
    let room = (MAX_OUTPUT_SIZE + 1).saturating_sub(out.len());
    out.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AeroBenchError::Cancelled);
    }
    Ok(())
}

fn ssh_err<'a, E: std::fmt::Display>(
    host: &'a str,
    context: &'static str,
) -> impl FnOnce(E) -> AeroBenchError + 'a {
    move |e| AeroBenchError::Ssh {
        host: host.to_string(),
        message: format!("{}: {}", context, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionKind;

    fn config(name: &str, address: &str, user: &str) -> HostConfig {
        HostConfig {
            name: name.to_string(),
            address: address.to_string(),
            internal_ip: None,
            user: user.to_string(),
            port: None,
            key_path: None,
            connection: ConnectionKind::Ssh,
            workdir: None,
        }
    }

    #[test]
    fn test_validate_config_empty_address() {
        let result = SshHost::new(config("w0", "", "ubuntu"));
        assert!(matches!(result, Err(AeroBenchError::Validation(_))));
    }

    #[test]
    fn test_validate_config_empty_user() {
        assert!(SshHost::new(config("w0", "10.0.0.1", "")).is_err());
    }

    #[test]
    fn test_validate_config_missing_key() {
        let mut cfg = config("w0", "10.0.0.1", "ubuntu");
        cfg.key_path = Some("/nonexistent/id_rsa".to_string());
        assert!(SshHost::new(cfg).is_err());
    }

    #[test]
    fn test_internal_ip_defaults_to_address() {
        let host = SshHost::new(config("w0", "10.0.0.1", "ubuntu")).unwrap();
        assert_eq!(host.internal_ip(), "10.0.0.1");

        let mut cfg = config("w1", "34.1.2.3", "ubuntu");
        cfg.internal_ip = Some("10.0.0.2".to_string());
        let host = SshHost::new(cfg).unwrap();
        assert_eq!(host.internal_ip(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_command_too_long_rejected_before_connecting() {
        let host = SshHost::new(config("w0", "10.0.0.1", "ubuntu")).unwrap();
        let command = "a".repeat(MAX_COMMAND_LEN + 1);
        let result = host
            .remote_command(&command, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AeroBenchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancelled_command_never_connects() {
        // TEST-NET-1 address; connecting would hang until the connect timeout
        let host = SshHost::new(config("w0", "192.0.2.1", "ubuntu")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        let result = host.remote_command("uptime", &cancel).await;
        assert!(matches!(result, Err(AeroBenchError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_session_setup_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        let result = SshHost::create_session(&config("w0", "192.0.2.1", "ubuntu"), &cancel);
        assert!(matches!(result, Err(AeroBenchError::Cancelled)));
        assert!(start.elapsed() < CONNECT_TIMEOUT);
    }

    #[test]
    fn test_append_capped_detects_overflow() {
        let mut out = vec![b'x'; MAX_OUTPUT_SIZE - 2];
        append_capped(&mut out, b"abcdef");
        assert_eq!(out.len(), MAX_OUTPUT_SIZE + 1);
        let (_, truncated) = truncate_output(&out);
        assert!(truncated);
    }
}
