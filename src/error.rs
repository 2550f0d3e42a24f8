//! Orchestration error taxonomy and the terminal status each error implies.

use std::time::Duration;

use thiserror::Error;

use crate::metrics::MetricError;
use crate::remote::RemoteError;
use crate::state::RunStatus;

/// Which phase issued a remote command. Decides whether a nonzero exit
/// aborts the run or fails it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Prerequisite setup: install, load module, configure.
    Setup,
    /// The workload under test.
    Workload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Workload => write!(f, "workload"),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("cannot reach {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("{host} did not reach {waiting_for} within {timeout:?}")]
    Timeout {
        host: String,
        waiting_for: String,
        timeout: Duration,
    },

    #[error("{phase} command on {host} exited {exit_code:?}: {stderr}")]
    RemoteCommand {
        phase: Phase,
        host: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("metric {field}: {reason}")]
    Parse { field: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl OrchestrationError {
    /// Terminal status the calling phase must take.
    pub fn disposition(&self) -> RunStatus {
        match self {
            OrchestrationError::Connection { .. }
            | OrchestrationError::Timeout { .. }
            | OrchestrationError::InvalidInput(_) => RunStatus::Aborted,
            OrchestrationError::RemoteCommand { phase: Phase::Setup, .. } => RunStatus::Aborted,
            OrchestrationError::RemoteCommand { phase: Phase::Workload, .. } => RunStatus::Failed,
            OrchestrationError::Parse { .. } => RunStatus::Failed,
        }
    }
}

impl From<RemoteError> for OrchestrationError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Connection { host, reason } | RemoteError::Spawn { host, reason } => {
                OrchestrationError::Connection { host, reason }
            }
            RemoteError::Timeout { host, timeout } => OrchestrationError::Timeout {
                host,
                waiting_for: "command completion".to_string(),
                timeout,
            },
        }
    }
}

impl From<MetricError> for OrchestrationError {
    fn from(e: MetricError) -> Self {
        match e {
            MetricError::Remote(remote) => remote.into(),
            MetricError::InvalidPattern { field, .. }
            | MetricError::MissingCapture { field } => {
                OrchestrationError::InvalidInput(format!("bad pattern for field {}", field))
            }
            MetricError::UnknownPreset(name) => {
                OrchestrationError::InvalidInput(format!("unknown field preset '{}'", name))
            }
            other => OrchestrationError::Parse {
                field: "log".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_table() {
        let conn = OrchestrationError::Connection {
            host: "rx".into(),
            reason: "no route".into(),
        };
        assert_eq!(conn.disposition(), RunStatus::Aborted);

        let timeout = OrchestrationError::Timeout {
            host: "rx".into(),
            waiting_for: "TestRunning".into(),
            timeout: Duration::from_secs(600),
        };
        assert_eq!(timeout.disposition(), RunStatus::Aborted);

        let setup = OrchestrationError::RemoteCommand {
            phase: Phase::Setup,
            host: "rx".into(),
            exit_code: Some(100),
            stderr: "E: Unable to locate package".into(),
        };
        assert_eq!(setup.disposition(), RunStatus::Aborted);

        let workload = OrchestrationError::RemoteCommand {
            phase: Phase::Workload,
            host: "rx".into(),
            exit_code: Some(1),
            stderr: String::new(),
        };
        assert_eq!(workload.disposition(), RunStatus::Failed);

        let parse = OrchestrationError::Parse {
            field: "tx_pps".into(),
            reason: "no samples".into(),
        };
        assert_eq!(parse.disposition(), RunStatus::Failed);
        assert_eq!(
            OrchestrationError::InvalidInput("no hosts".into()).disposition(),
            RunStatus::Aborted
        );
    }

    #[test]
    fn test_remote_errors_stay_infrastructure() {
        let e: OrchestrationError = RemoteError::Connection {
            host: "tx".into(),
            reason: "Permission denied (publickey)".into(),
        }
        .into();
        assert!(matches!(e, OrchestrationError::Connection { .. }));
        assert_eq!(e.disposition(), RunStatus::Aborted);

        let e: OrchestrationError = MetricError::Fetch {
            host: "tx".into(),
            path: "/tmp/tx.log".into(),
            reason: "No such file".into(),
        }
        .into();
        assert!(matches!(e, OrchestrationError::Parse { .. }));
    }
}
