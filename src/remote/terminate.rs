//! Terminate-then-verify for background workloads.
//!
//! A workload that outlives its budget gets SIGTERM, a grace period, a
//! liveness check, then SIGKILL and a second check. The outcome says which
//! step stopped it, or that nothing did.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::{shell_quote, ExecMode, RemoteError, RemoteExecutor};
use crate::clock::Clock;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Nothing by that name was running.
    NotRunning,
    /// Exited after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Survived SIGKILL.
    StillRunning,
}

impl TerminationOutcome {
    pub fn is_stopped(&self) -> bool {
        !matches!(self, TerminationOutcome::StillRunning)
    }
}

/// One process on one host that must be stopped.
#[derive(Debug, Clone)]
pub struct TerminationTarget {
    pub host: Host,
    pub process: String,
}

async fn is_running(
    executor: &dyn RemoteExecutor,
    host: &Host,
    process: &str,
) -> Result<bool, RemoteError> {
    let result = executor
        .execute(host, &liveness_command(process), ExecMode::Blocking)
        .await?;
    Ok(result.is_success())
}

/// The kernel keeps at most this many bytes of a process name (`comm`).
pub const MAX_PROCESS_NAME: usize = 15;

/// A name `ps` and `pkill -x` can match exactly: non-empty, one word, and
/// no longer than the kernel's `comm`.
pub fn check_process_name(process: &str) -> Result<(), String> {
    if process.is_empty() {
        return Err("process name is empty".to_string());
    }
    if process.chars().any(char::is_whitespace) {
        return Err(format!("process name '{}' contains whitespace", process));
    }
    if process.len() > MAX_PROCESS_NAME {
        return Err(format!(
            "process name '{}' is {} bytes; the kernel truncates names to {}, so it would never match",
            process,
            process.len(),
            MAX_PROCESS_NAME
        ));
    }
    Ok(())
}

/// Exits 0 when a non-zombie process named exactly `process` exists. An
/// orphaned workload that already exited stays a zombie until reaped, and
/// `pgrep` would still report it.
pub fn liveness_command(process: &str) -> String {
    format!(
        "ps -eo stat=,comm= | awk -v p={} '$2 == p && $1 !~ /^Z/ {{ found = 1 }} END {{ exit !found }}'",
        shell_quote(process)
    )
}

async fn signal(
    executor: &dyn RemoteExecutor,
    host: &Host,
    process: &str,
    sig: &str,
) -> Result<(), RemoteError> {
    executor
        .execute(
            host,
            &format!("pkill -{} -x {}", sig, shell_quote(process)),
            ExecMode::Blocking,
        )
        .await?;
    Ok(())
}

/// Stop `process` on `host`, escalating from SIGTERM to SIGKILL.
pub async fn terminate_and_verify(
    executor: &dyn RemoteExecutor,
    clock: &dyn Clock,
    host: &Host,
    process: &str,
    grace: Duration,
) -> Result<TerminationOutcome, RemoteError> {
    if !is_running(executor, host, process).await? {
        return Ok(TerminationOutcome::NotRunning);
    }

    signal(executor, host, process, "TERM").await?;
    clock.sleep(grace).await;
    if !is_running(executor, host, process).await? {
        info!(host = %host.name, %process, "terminated");
        return Ok(TerminationOutcome::Terminated);
    }

    warn!(host = %host.name, %process, "ignored SIGTERM, sending SIGKILL");
    signal(executor, host, process, "KILL").await?;
    clock.sleep(grace).await;
    if !is_running(executor, host, process).await? {
        return Ok(TerminationOutcome::Killed);
    }

    warn!(host = %host.name, %process, "still running after SIGKILL");
    Ok(TerminationOutcome::StillRunning)
}

/// Stop every target concurrently. Results are in target order.
pub async fn terminate_all(
    executor: &dyn RemoteExecutor,
    clock: &dyn Clock,
    targets: &[TerminationTarget],
    grace: Duration,
) -> Vec<Result<TerminationOutcome, RemoteError>> {
    join_all(
        targets
            .iter()
            .map(|t| terminate_and_verify(executor, clock, &t.host, &t.process, grace)),
    )
    .await
}
