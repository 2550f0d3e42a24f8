//! Per-run lifecycle.
//!
//! ```text
//! Created ──start──▶ Running ──▶ Completed | Failed | Aborted | Skipped
//!    └───────reject─────────────▶ Aborted
//! ```
//!
//! Terminal states are final. The terminal marker is published exactly once;
//! anything that arrives afterwards is logged and dropped.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::marker::{MarkerSink, StateMarker};
use crate::outcome::{aggregate, FinalVerdict, SubTestVerdict, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Aborted,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Created | RunStatus::Running)
    }

    pub fn marker(&self) -> Option<StateMarker> {
        match self {
            RunStatus::Created => None,
            RunStatus::Running => Some(StateMarker::TestRunning),
            RunStatus::Completed => Some(StateMarker::TestCompleted),
            RunStatus::Failed => Some(StateMarker::TestFailed),
            RunStatus::Aborted => Some(StateMarker::TestAborted),
            RunStatus::Skipped => Some(StateMarker::TestSkipped),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RunStatus::Created),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

impl From<FinalVerdict> for RunStatus {
    fn from(v: FinalVerdict) -> Self {
        match v {
            FinalVerdict::Completed => RunStatus::Completed,
            FinalVerdict::Failed => RunStatus::Failed,
            FinalVerdict::Skipped => RunStatus::Skipped,
            FinalVerdict::Aborted => RunStatus::Aborted,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: RunStatus, to: RunStatus },

    #[error("run already finished as {0}")]
    AlreadyTerminal(RunStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    pub name: String,
    pub status: RunStatus,
    pub verdicts: Vec<SubTestVerdict>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the terminal marker reached its sink.
    pub marker_published: bool,
}

impl RunState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            status: RunStatus::Created,
            verdicts: Vec::new(),
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            marker_published: false,
        }
    }
}

pub struct TestStateMachine {
    state: RunState,
    sink: Arc<dyn MarkerSink>,
}

impl TestStateMachine {
    pub fn new(name: impl Into<String>, sink: Arc<dyn MarkerSink>) -> Self {
        Self {
            state: RunState::new(name),
            sink,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn status(&self) -> RunStatus {
        self.state.status
    }

    pub fn into_state(self) -> RunState {
        self.state
    }

    /// Inputs validated: `Created -> Running`.
    pub async fn start(&mut self) -> Result<(), TransitionError> {
        self.require(RunStatus::Created, RunStatus::Running)?;
        self.state.status = RunStatus::Running;
        self.state.started_at = Some(Utc::now());
        info!(run = %self.state.id, name = %self.state.name, "run started");
        if let Err(e) = self.sink.publish(&StateMarker::TestRunning).await {
            warn!(run = %self.state.id, error = %e, "could not publish running marker");
        }
        Ok(())
    }

    /// Inputs missing or malformed: `Created -> Aborted` without running.
    pub async fn reject(&mut self, reason: impl Into<String>) -> Result<RunStatus, TransitionError> {
        self.require(RunStatus::Created, RunStatus::Aborted)?;
        self.finalize(RunStatus::Aborted, Some(reason.into())).await
    }

    /// Add a sub-test verdict. After the run is terminal the verdict is
    /// logged and discarded; returns whether it was accepted.
    pub fn record(&mut self, verdict: SubTestVerdict) -> bool {
        match self.state.status {
            RunStatus::Running => {
                info!(
                    run = %self.state.id,
                    subtest = %verdict.name,
                    verdict = %verdict.verdict,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "sub-test finished"
                );
                self.state.verdicts.push(verdict);
                true
            }
            status => {
                warn!(
                    run = %self.state.id,
                    %status,
                    subtest = %verdict.name,
                    verdict = %verdict.verdict,
                    "ignoring result outside a running run"
                );
                false
            }
        }
    }

    /// Environment lacks a required capability.
    pub async fn skip(&mut self, reason: impl Into<String>) -> Result<RunStatus, TransitionError> {
        self.require(RunStatus::Running, RunStatus::Skipped)?;
        self.finalize(RunStatus::Skipped, Some(reason.into())).await
    }

    /// Infrastructure failure. Allowed from `Created` as well.
    pub async fn abort(&mut self, reason: impl Into<String>) -> Result<RunStatus, TransitionError> {
        if self.state.status.is_terminal() {
            return Err(self.late(RunStatus::Aborted));
        }
        self.finalize(RunStatus::Aborted, Some(reason.into())).await
    }

    /// Workload ran but its result is outside the pass criteria.
    pub async fn fail(&mut self, reason: impl Into<String>) -> Result<RunStatus, TransitionError> {
        self.require(RunStatus::Running, RunStatus::Failed)?;
        self.finalize(RunStatus::Failed, Some(reason.into())).await
    }

    /// Fold recorded verdicts and take the resulting terminal state.
    pub async fn finish(&mut self) -> Result<RunStatus, TransitionError> {
        let status = RunStatus::from(aggregate(&self.state.verdicts));
        self.require(RunStatus::Running, status)?;
        let deciding = match status {
            RunStatus::Failed => Some(Verdict::Failed),
            RunStatus::Aborted => Some(Verdict::Aborted),
            RunStatus::Skipped => Some(Verdict::Skipped),
            _ => None,
        };
        let reason = if self.state.verdicts.is_empty() {
            Some("no sub-tests ran".to_string())
        } else {
            deciding.and_then(|d| {
                self.state
                    .verdicts
                    .iter()
                    .find(|v| v.verdict == d)
                    .and_then(|v| v.reason.clone())
            })
        };
        self.finalize(status, reason).await
    }

    fn require(&self, from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
        if self.state.status.is_terminal() {
            return Err(self.late(to));
        }
        if self.state.status != from {
            return Err(TransitionError::Illegal {
                from: self.state.status,
                to,
            });
        }
        Ok(())
    }

    fn late(&self, attempted: RunStatus) -> TransitionError {
        warn!(
            run = %self.state.id,
            status = %self.state.status,
            %attempted,
            "late transition ignored"
        );
        TransitionError::AlreadyTerminal(self.state.status)
    }

    async fn finalize(
        &mut self,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<RunStatus, TransitionError> {
        self.state.status = status;
        self.state.reason = reason;
        self.state.finished_at = Some(Utc::now());
        info!(
            run = %self.state.id,
            name = %self.state.name,
            %status,
            reason = self.state.reason.as_deref().unwrap_or(""),
            "run finished"
        );
        if let Some(marker) = status.marker() {
            match self.sink.publish(&marker).await {
                Ok(()) => self.state.marker_published = true,
                Err(e) => error!(run = %self.state.id, %marker, error = %e, "could not publish terminal marker"),
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<StateMarker>>,
    }

    #[async_trait::async_trait]
    impl MarkerSink for RecordingSink {
        async fn publish(&self, marker: &StateMarker) -> Result<(), RemoteError> {
            self.published.lock().unwrap().push(marker.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait::async_trait]
    impl MarkerSink for BrokenSink {
        async fn publish(&self, _marker: &StateMarker) -> Result<(), RemoteError> {
            Err(RemoteError::Connection {
                host: "ctl".to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    fn machine() -> (TestStateMachine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (TestStateMachine::new("fwd", sink.clone()), sink)
    }

    fn published(sink: &RecordingSink) -> Vec<StateMarker> {
        sink.published.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let (mut sm, sink) = machine();
        sm.start().await.unwrap();
        assert!(sm.record(SubTestVerdict::passed("a")));
        assert!(sm.record(SubTestVerdict::skipped("b", "no sriov")));
        assert_eq!(sm.finish().await.unwrap(), RunStatus::Completed);
        assert_eq!(
            published(&sink),
            vec![StateMarker::TestRunning, StateMarker::TestCompleted]
        );
        assert!(sm.state().marker_published);
        assert!(sm.state().finished_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_input_aborts_without_running() {
        let (mut sm, sink) = machine();
        assert_eq!(sm.reject("missing address").await.unwrap(), RunStatus::Aborted);
        assert!(sm.state().started_at.is_none());
        assert_eq!(published(&sink), vec![StateMarker::TestAborted]);
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        let (mut sm, sink) = machine();
        sm.start().await.unwrap();
        sm.fail("tx_pps too low").await.unwrap();

        assert_eq!(
            sm.abort("late timeout").await,
            Err(TransitionError::AlreadyTerminal(RunStatus::Failed))
        );
        assert_eq!(
            sm.finish().await,
            Err(TransitionError::AlreadyTerminal(RunStatus::Failed))
        );
        assert!(!sm.record(SubTestVerdict::passed("late")));
        assert_eq!(sm.status(), RunStatus::Failed);
        assert!(sm.state().verdicts.is_empty());
        // one running marker, one terminal marker
        assert_eq!(
            published(&sink),
            vec![StateMarker::TestRunning, StateMarker::TestFailed]
        );
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let (mut sm, _) = machine();
        assert_eq!(
            sm.skip("x").await,
            Err(TransitionError::Illegal {
                from: RunStatus::Created,
                to: RunStatus::Skipped
            })
        );
        assert!(!sm.record(SubTestVerdict::passed("early")));
        sm.start().await.unwrap();
        assert_eq!(
            sm.start().await,
            Err(TransitionError::Illegal {
                from: RunStatus::Running,
                to: RunStatus::Running
            })
        );
        assert!(matches!(sm.reject("x").await, Err(TransitionError::Illegal { .. })));
    }

    #[tokio::test]
    async fn test_finish_uses_aggregate() {
        let (mut sm, _) = machine();
        sm.start().await.unwrap();
        sm.record(SubTestVerdict::passed("a"));
        sm.record(SubTestVerdict::failed("b", "rx_pps below 1000000"));
        assert_eq!(sm.finish().await.unwrap(), RunStatus::Failed);
        assert_eq!(sm.state().reason.as_deref(), Some("rx_pps below 1000000"));

        let (mut empty, _) = machine();
        empty.start().await.unwrap();
        assert_eq!(empty.finish().await.unwrap(), RunStatus::Aborted);
        assert_eq!(empty.state().reason.as_deref(), Some("no sub-tests ran"));
    }

    #[tokio::test]
    async fn test_publish_failure_is_recorded() {
        let mut sm = TestStateMachine::new("fwd", Arc::new(BrokenSink));
        sm.start().await.unwrap();
        sm.record(SubTestVerdict::passed("a"));
        assert_eq!(sm.finish().await.unwrap(), RunStatus::Completed);
        assert!(!sm.state().marker_published);
    }

    #[test]
    fn test_status_strings() {
        for s in [
            RunStatus::Created,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Aborted,
            RunStatus::Skipped,
        ] {
            assert_eq!(s.as_str().parse::<RunStatus>().unwrap(), s);
        }
        assert!(RunStatus::Skipped.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
