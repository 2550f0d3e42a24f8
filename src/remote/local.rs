//! Runs commands on the orchestrating machine with `sh -c`.
//!
//! Used for single-box rehearsals and for roles that live on the controller
//! itself. The host's address is ignored.

use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;
use tracing::debug;

use super::{background_wrapper, ExecMode, RemoteCommandResult, RemoteError, RemoteExecutor};
use crate::host::Host;

#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    /// Working directory for every command. Inherits the process cwd if unset.
    workdir: Option<std::path::PathBuf>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            workdir: Some(dir.into()),
        }
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        mode: ExecMode,
    ) -> Result<RemoteCommandResult, RemoteError> {
        let shell_command = match mode {
            ExecMode::Blocking => command.to_string(),
            ExecMode::Detached => background_wrapper(command),
        };
        debug!(host = %host.name, ?mode, %command, "local exec");

        let started_at = Utc::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&shell_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| RemoteError::Spawn {
            host: host.name.clone(),
            reason: format!("failed to run sh: {}", e),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match mode {
            ExecMode::Detached if !output.status.success() => Err(RemoteError::Spawn {
                host: host.name.clone(),
                reason: format!("background launch failed: {}", stderr.trim()),
            }),
            ExecMode::Detached => Ok(RemoteCommandResult::detached(host, command, started_at)),
            ExecMode::Blocking => Ok(RemoteCommandResult {
                host: host.name.clone(),
                command: command.to_string(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
                started_at,
                finished_at: Some(Utc::now()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Role;

    fn host() -> Host {
        Host::new("local", "localhost", Role::Client)
    }

    #[tokio::test]
    async fn test_blocking_captures_output_and_status() {
        let exec = LocalExecutor::new();
        let result = exec
            .execute(&host(), "echo out; echo err >&2; exit 3", ExecMode::Blocking)
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(result.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_detached_returns_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = LocalExecutor::in_dir(dir.path());
        let started = std::time::Instant::now();
        let result = exec
            .execute(&host(), "sleep 3; touch done", ExecMode::Detached)
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(result.is_detached());
        assert!(!dir.path().join("done").exists());
    }
}
