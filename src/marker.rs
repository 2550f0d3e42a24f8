//! Per-host state marker: a one-token text file a remote peer rewrites as it
//! progresses and the orchestrator reads to observe it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::host::Host;
use crate::remote::{shell_quote, ExecMode, RemoteError, RemoteExecutor};

/// Known marker tokens. Workload-specific tokens are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateMarker {
    TestRunning,
    TestCompleted,
    TestFailed,
    TestAborted,
    TestSkipped,
    NetperfRunning,
    Custom(String),
}

impl StateMarker {
    pub fn as_token(&self) -> &str {
        match self {
            StateMarker::TestRunning => "TestRunning",
            StateMarker::TestCompleted => "TestCompleted",
            StateMarker::TestFailed => "TestFailed",
            StateMarker::TestAborted => "TestAborted",
            StateMarker::TestSkipped => "TestSkipped",
            StateMarker::NetperfRunning => "NetperfRunning",
            StateMarker::Custom(token) => token,
        }
    }

    /// Parse a marker file's content. Blank content means "no marker yet".
    pub fn parse(content: &str) -> Option<Self> {
        let token = content.lines().next()?.trim();
        if token.is_empty() {
            return None;
        }
        Some(match token {
            "TestRunning" => StateMarker::TestRunning,
            "TestCompleted" => StateMarker::TestCompleted,
            "TestFailed" => StateMarker::TestFailed,
            "TestAborted" => StateMarker::TestAborted,
            "TestSkipped" => StateMarker::TestSkipped,
            "NetperfRunning" => StateMarker::NetperfRunning,
            other => StateMarker::Custom(other.to_string()),
        })
    }

    /// Markers that mean the peer gave up.
    pub fn default_fail_states() -> Vec<StateMarker> {
        vec![StateMarker::TestFailed, StateMarker::TestAborted]
    }
}

impl fmt::Display for StateMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl std::str::FromStr for StateMarker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateMarker::parse(s).ok_or_else(|| "empty marker token".to_string())
    }
}

/// Anything the poller can read a marker from.
#[async_trait::async_trait]
pub trait MarkerSource: Send + Sync {
    /// `Ok(None)` when the marker does not exist yet.
    async fn read_marker(&self, host: &Host) -> Result<Option<StateMarker>, RemoteError>;
}

/// Reads and writes the marker file through a [`RemoteExecutor`].
#[derive(Clone)]
pub struct MarkerStore {
    executor: Arc<dyn RemoteExecutor>,
    path: String,
}

impl MarkerStore {
    pub fn new(executor: Arc<dyn RemoteExecutor>, path: impl Into<String>) -> Self {
        Self {
            executor,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read_command(&self) -> String {
        format!("cat {}", shell_quote(&self.path))
    }

    pub fn write_command(&self, marker: &StateMarker) -> String {
        format!(
            "printf '%s\\n' {} > {}",
            shell_quote(marker.as_token()),
            shell_quote(&self.path)
        )
    }

    /// Overwrite the marker on `host`. A nonzero exit is reported as a
    /// connection-level failure: the marker is the sole external signal.
    pub async fn write_marker(&self, host: &Host, marker: &StateMarker) -> Result<(), RemoteError> {
        let result = self
            .executor
            .execute(host, &self.write_command(marker), ExecMode::Blocking)
            .await?;
        if !result.is_success() {
            return Err(RemoteError::Connection {
                host: host.name.clone(),
                reason: format!(
                    "could not write marker {} to {}: {}",
                    marker,
                    self.path,
                    result.stderr.trim()
                ),
            });
        }
        debug!(host = %host.name, %marker, path = %self.path, "marker written");
        Ok(())
    }
}

#[async_trait::async_trait]
impl MarkerSource for MarkerStore {
    async fn read_marker(&self, host: &Host) -> Result<Option<StateMarker>, RemoteError> {
        let result = self
            .executor
            .execute(host, &self.read_command(), ExecMode::Blocking)
            .await?;
        if !result.is_success() {
            // Missing or unreadable file: not there yet.
            return Ok(None);
        }
        Ok(StateMarker::parse(&result.stdout))
    }
}

/// Where a run publishes its own state for an external controller.
#[async_trait::async_trait]
pub trait MarkerSink: Send + Sync {
    async fn publish(&self, marker: &StateMarker) -> Result<(), RemoteError>;
}

/// Publishes to the marker file on one host.
pub struct HostMarker {
    pub store: MarkerStore,
    pub host: Host,
}

#[async_trait::async_trait]
impl MarkerSink for HostMarker {
    async fn publish(&self, marker: &StateMarker) -> Result<(), RemoteError> {
        self.store.write_marker(&self.host, marker).await
    }
}

/// Publishes to a file on the orchestrating machine.
pub struct FileMarker {
    path: PathBuf,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl MarkerSink for FileMarker {
    async fn publish(&self, marker: &StateMarker) -> Result<(), RemoteError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| RemoteError::Spawn {
                    host: "local".to_string(),
                    reason: format!("create {}: {}", parent.display(), e),
                })?;
            }
        }
        tokio::fs::write(&self.path, format!("{}\n", marker.as_token()))
            .await
            .map_err(|e| RemoteError::Spawn {
                host: "local".to_string(),
                reason: format!("write {}: {}", self.path.display(), e),
            })?;
        debug!(%marker, path = %self.path.display(), "local marker written");
        Ok(())
    }
}
