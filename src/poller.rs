//! Readiness polling: block until a remote peer's marker reaches an accepted
//! state, reaches a failure state, or the time budget runs out.
//!
//! Remote peers cannot call back, so the marker file is re-read on a fixed
//! (optionally growing) interval. The final wait is clipped to the remaining
//! budget, and a read that hangs is abandoned once the budget (or one
//! interval, for the read at the deadline) is spent. Together these bound the
//! total wait by `timeout` plus one poll.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::PollSettings;
use crate::host::Host;
use crate::marker::{MarkerSource, StateMarker};

/// Interval, budget and backoff for one wait.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Interval multiplier after each poll that didn't settle. 1.0 = fixed.
    pub backoff: f64,
    pub max_interval: Duration,
    /// Random extra delay up to this fraction of the interval.
    pub jitter: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            backoff: 1.0,
            max_interval: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            timeout: Duration::from_secs(settings.timeout_secs),
            backoff: settings.backoff.max(1.0),
            max_interval: Duration::from_secs(settings.max_interval_secs),
            jitter: 0.0,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff).min(self.max_interval.max(self.interval))
    }
}

/// The states a wait accepts and rejects.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pub accept: Vec<StateMarker>,
    pub fail: Vec<StateMarker>,
}

impl WaitSpec {
    pub fn accept(accept: Vec<StateMarker>) -> Self {
        Self {
            accept,
            fail: StateMarker::default_fail_states(),
        }
    }

    pub fn with_fail(mut self, fail: Vec<StateMarker>) -> Self {
        self.fail = fail;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PollResult {
    Ready {
        marker: StateMarker,
        elapsed: Duration,
        polls: u32,
    },
    RemoteFailed {
        marker: StateMarker,
        elapsed: Duration,
        polls: u32,
    },
    TimedOut {
        last_seen: Option<StateMarker>,
        elapsed: Duration,
        polls: u32,
    },
}

impl PollResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollResult::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollResult::Ready { elapsed, .. }
            | PollResult::RemoteFailed { elapsed, .. }
            | PollResult::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    pub fn polls(&self) -> u32 {
        match self {
            PollResult::Ready { polls, .. }
            | PollResult::RemoteFailed { polls, .. }
            | PollResult::TimedOut { polls, .. } => *polls,
        }
    }
}

pub struct ReadinessPoller<'a> {
    source: &'a dyn MarkerSource,
    clock: &'a dyn Clock,
}

impl<'a> ReadinessPoller<'a> {
    pub fn new(source: &'a dyn MarkerSource, clock: &'a dyn Clock) -> Self {
        Self { source, clock }
    }

    /// Poll `host` until its marker is in `spec.accept` (→ `Ready`), in
    /// `spec.fail` (→ `RemoteFailed`), or `config.timeout` elapses
    /// (→ `TimedOut`). Unreadable markers and reads that outlast their
    /// deadline count as "not yet".
    pub async fn wait_for_state(&self, host: &Host, spec: &WaitSpec, config: &PollConfig) -> PollResult {
        let start = self.clock.now();
        let mut interval = config.interval.max(Duration::from_millis(1));
        let mut polls = 0u32;
        let mut last_seen = None;

        info!(
            host = %host.name,
            accept = ?spec.accept,
            interval_secs = config.interval.as_secs_f64(),
            timeout_secs = config.timeout.as_secs_f64(),
            "waiting for remote state"
        );

        loop {
            polls += 1;
            let read_budget = config
                .timeout
                .saturating_sub(self.clock.now() - start)
                .max(config.interval);
            let read = tokio::select! {
                biased;
                read = self.source.read_marker(host) => Some(read),
                _ = self.clock.sleep(read_budget) => None,
            };
            match read {
                None => warn!(
                    host = %host.name,
                    polls,
                    budget_secs = read_budget.as_secs_f64(),
                    "marker read did not finish in time"
                ),
                Some(Ok(Some(marker))) => {
                    let elapsed = self.clock.now() - start;
                    if spec.accept.contains(&marker) {
                        info!(host = %host.name, %marker, polls, elapsed_secs = elapsed.as_secs_f64(), "remote ready");
                        return PollResult::Ready { marker, elapsed, polls };
                    }
                    if spec.fail.contains(&marker) {
                        warn!(host = %host.name, %marker, polls, "remote reported failure");
                        return PollResult::RemoteFailed { marker, elapsed, polls };
                    }
                    debug!(host = %host.name, %marker, polls, "not ready yet");
                    last_seen = Some(marker);
                }
                Some(Ok(None)) => debug!(host = %host.name, polls, "marker absent"),
                Some(Err(e)) => debug!(host = %host.name, polls, error = %e, "marker unreadable"),
            }

            let elapsed = self.clock.now() - start;
            if elapsed >= config.timeout {
                warn!(host = %host.name, polls, last_seen = ?last_seen, "readiness wait timed out");
                return PollResult::TimedOut { last_seen, elapsed, polls };
            }

            let mut wait = interval;
            if config.jitter > 0.0 {
                let extra = rand::thread_rng().gen_range(0.0..config.jitter);
                wait += interval.mul_f64(extra);
            }
            // The last wait lands exactly on the deadline.
            let wait = wait.min(config.timeout - elapsed);
            self.clock.sleep(wait).await;
            interval = config.next_interval(interval);
        }
    }
}
