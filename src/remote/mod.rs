//! Remote command channel: run a command on a named host and get back a
//! structured result.
//!
//! Transport failures (host unreachable, authentication refused) surface as
//! [`RemoteError`]. A command that ran and exited nonzero is *not* an error
//! at this layer; it is a [`RemoteCommandResult`] whose `exit_code` the
//! caller inspects.

pub mod fake;
pub mod local;
pub mod ssh;
pub mod terminate;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ExecutorConfig, ExecutorKind};
use crate::host::Host;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot reach host {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("failed to start command transport for {host}: {reason}")]
    Spawn { host: String, reason: String },

    #[error("command on {host} did not finish within {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

impl RemoteError {
    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection { .. })
    }
}

/// How a command is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Wait for completion and capture everything.
    Blocking,
    /// Start in the background on the host and return at once.
    Detached,
}

/// Outcome of one executor invocation. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteCommandResult {
    /// Name of the host the command ran on.
    pub host: String,
    pub command: String,
    /// `None` for detached commands: completion is not observed.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RemoteCommandResult {
    pub fn detached(host: &Host, command: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            host: host.name.clone(),
            command: command.to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at,
            finished_at: None,
        }
    }

    /// True only for an observed zero exit code. Empty output proves nothing.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn is_detached(&self) -> bool {
        self.exit_code.is_none() && self.finished_at.is_none()
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|f| f - self.started_at)
    }
}

/// Executes command strings against hosts. Implementations hold no
/// per-command state and can be shared freely across hosts and tasks.
#[async_trait::async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        mode: ExecMode,
    ) -> Result<RemoteCommandResult, RemoteError>;
}

#[async_trait::async_trait]
impl<T: RemoteExecutor + ?Sized> RemoteExecutor for Arc<T> {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        mode: ExecMode,
    ) -> Result<RemoteCommandResult, RemoteError> {
        (**self).execute(host, command, mode).await
    }
}

/// Build the executor selected in configuration.
pub fn from_config(config: &ExecutorConfig) -> Arc<dyn RemoteExecutor> {
    match config.kind {
        ExecutorKind::Ssh => Arc::new(ssh::SshExecutor::new(config)),
        ExecutorKind::Local => Arc::new(local::LocalExecutor::new()),
    }
}

/// Bound a command (including any retries it makes) by an overall deadline.
pub async fn with_deadline<F>(
    host: &Host,
    deadline: Duration,
    command: F,
) -> Result<RemoteCommandResult, RemoteError>
where
    F: Future<Output = Result<RemoteCommandResult, RemoteError>>,
{
    match tokio::time::timeout(deadline, command).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            host: host.name.clone(),
            timeout: deadline,
        }),
    }
}

/// Retry schedule for connection failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
            backoff: 1.0,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            retries: config.connect_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
            backoff: config.retry_backoff.max(1.0),
        }
    }
}

/// Execute, retrying only on [`RemoteError::Connection`].
pub async fn execute_with_retry(
    executor: &dyn RemoteExecutor,
    clock: &dyn Clock,
    policy: &RetryPolicy,
    host: &Host,
    command: &str,
    mode: ExecMode,
) -> Result<RemoteCommandResult, RemoteError> {
    let mut delay = policy.delay;
    let mut attempt = 0;
    loop {
        match executor.execute(host, command, mode).await {
            Err(e) if e.is_connection() && attempt < policy.retries => {
                attempt += 1;
                warn!(
                    host = %host.name,
                    attempt,
                    retries = policy.retries,
                    error = %e,
                    "connection failed, retrying"
                );
                clock.sleep(delay).await;
                delay = delay.mul_f64(policy.backoff);
            }
            other => {
                if attempt > 0 {
                    debug!(host = %host.name, attempt, "command finished after retry");
                }
                return other;
            }
        }
    }
}

/// Quote a string for safe interpolation into a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Wrap a command so it keeps running after the launching shell exits.
pub fn background_wrapper(command: &str) -> String {
    format!(
        "nohup sh -c {} > /dev/null 2>&1 < /dev/null &",
        shell_quote(command)
    )
}
