//! OpenSSH client transport.
//!
//! Commands run through the system `ssh` binary in batch mode. ssh exits 255
//! on its own failures (unreachable host, refused key), but a remote command
//! may exit 255 too. A 255 only counts as a connection failure when ssh also
//! left one of its diagnostics on stderr.

use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use super::{background_wrapper, ExecMode, RemoteCommandResult, RemoteError, RemoteExecutor};
use crate::config::ExecutorConfig;
use crate::host::{validate_address, Host};

const SSH_CONNECTION_FAILURE: i32 = 255;

/// Messages the OpenSSH client prints when it never ran the command.
const SSH_DIAGNOSTICS: &[&str] = &[
    "Permission denied",
    "Connection refused",
    "Connection timed out",
    "Connection closed by",
    "Connection reset by",
    "Could not resolve hostname",
    "Host key verification failed",
    "No route to host",
    "Network is unreachable",
    "kex_exchange_identification",
    "banner exchange",
];

fn is_ssh_failure(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        let line = line.trim();
        line.starts_with("ssh:") || SSH_DIAGNOSTICS.iter().any(|d| line.contains(d))
    })
}

pub struct SshExecutor {
    ssh_binary: String,
    user: String,
    port: u16,
    identity_file: Option<String>,
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            ssh_binary: config.ssh_binary.clone(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
        }
    }

    /// Arguments placed before the destination.
    fn base_args(&self, host: &Host) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];

        if let Some(key) = host.identity_file.as_ref().or(self.identity_file.as_ref()) {
            args.push("-i".to_string());
            args.push(key.clone());
        }

        args
    }

    fn destination(&self, host: &Host) -> String {
        let user = host.user.as_deref().unwrap_or(&self.user);
        format!("{}@{}", user, host.address)
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        mode: ExecMode,
    ) -> Result<RemoteCommandResult, RemoteError> {
        validate_address(&host.address).map_err(|reason| RemoteError::Connection {
            host: host.name.clone(),
            reason,
        })?;

        let remote_command = match mode {
            ExecMode::Blocking => command.to_string(),
            ExecMode::Detached => background_wrapper(command),
        };

        debug!(host = %host.name, address = %host.address, ?mode, %command, "ssh exec");
        let started_at = Utc::now();

        let output = Command::new(&self.ssh_binary)
            .args(self.base_args(host))
            .arg(self.destination(host))
            .arg("--")
            .arg(&remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::Spawn {
                host: host.name.clone(),
                reason: format!("failed to run '{}': {}", self.ssh_binary, e),
            })?;

        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // Killed by a signal locally, or ssh's own failure status.
        if code.is_none() || (code == Some(SSH_CONNECTION_FAILURE) && is_ssh_failure(&stderr)) {
            return Err(RemoteError::Connection {
                host: host.name.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        match mode {
            ExecMode::Detached => {
                if code != Some(0) {
                    return Err(RemoteError::Spawn {
                        host: host.name.clone(),
                        reason: format!("background launch failed: {}", stderr.trim()),
                    });
                }
                info!(host = %host.name, %command, "detached command launched");
                Ok(RemoteCommandResult::detached(host, command, started_at))
            }
            ExecMode::Blocking => Ok(RemoteCommandResult {
                host: host.name.clone(),
                command: command.to_string(),
                exit_code: code,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
                started_at,
                finished_at: Some(Utc::now()),
            }),
        }
    }
}
