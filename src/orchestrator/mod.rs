//! Drives one run end to end.
//!
//! Validate the plan, resolve host capabilities, run setup, then for each
//! test configuration: launch workloads group by group (each group
//! confirmed started before the next), let them overlap for the workload
//! duration, stop them with terminate-then-verify, read their logs and judge
//! the criteria. Sub-test verdicts feed the state machine, which settles the
//! run's terminal state.

pub mod plan;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LisorchConfig;
use crate::error::{OrchestrationError, Phase};
use crate::host::{Host, HostCapabilities};
use crate::marker::{FileMarker, HostMarker, MarkerSink, MarkerStore, StateMarker};
use crate::metrics::criteria::{judge, CriterionResult};
use crate::metrics::{collect_remote_log, FieldPattern, MetricError, MetricSet, TestConfiguration};
use crate::outcome::{SubTestVerdict, Verdict};
use crate::poller::{PollConfig, PollResult, ReadinessPoller, WaitSpec};
use crate::remote::terminate::{terminate_all, TerminationOutcome, TerminationTarget};
use crate::remote::{
    execute_with_retry, shell_quote, with_deadline, ExecMode, RemoteCommandResult, RemoteError,
    RemoteExecutor, RetryPolicy,
};
use crate::state::{RunState, RunStatus, TestStateMachine};

pub use plan::{render, Plan, SetupStep, Workload, WorkloadMode};

#[derive(Debug, Clone, Serialize)]
pub struct TerminationRecord {
    pub host: String,
    pub process: String,
    pub outcome: Option<TerminationOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationReport {
    pub configuration: TestConfiguration,
    pub verdict: SubTestVerdict,
    pub criteria: Vec<CriterionResult>,
    pub terminations: Vec<TerminationRecord>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub capabilities: BTreeMap<String, HostCapabilities>,
    pub configurations: Vec<ConfigurationReport>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        self.state.status
    }
}

pub struct Orchestrator {
    executor: Arc<dyn RemoteExecutor>,
    clock: Arc<dyn Clock>,
    poll: PollConfig,
    retry: RetryPolicy,
    marker_path: String,
    command_timeout: Duration,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn RemoteExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor,
            clock,
            poll: PollConfig::default(),
            retry: RetryPolicy::none(),
            marker_path: "state.txt".to_string(),
            command_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(
        config: &LisorchConfig,
        executor: Arc<dyn RemoteExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            clock,
            poll: PollConfig::from_settings(&config.poll),
            retry: RetryPolicy::from_config(&config.executor),
            marker_path: config.marker.path.clone(),
            command_timeout: config.executor.command_timeout(),
        }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_marker_path(mut self, path: impl Into<String>) -> Self {
        self.marker_path = path.into();
        self
    }

    fn marker_store(&self) -> MarkerStore {
        MarkerStore::new(self.executor.clone(), self.marker_path.clone())
    }

    /// Where the run publishes its own state: the plan's marker host, or a
    /// local file when the plan names none.
    pub fn marker_sink(&self, plan: &Plan, local_path: &Path) -> Arc<dyn MarkerSink> {
        match plan.marker_host.as_deref().and_then(|name| plan.host(name)) {
            Some(host) => Arc::new(HostMarker {
                store: self.marker_store(),
                host: host.clone(),
            }),
            None => Arc::new(FileMarker::new(local_path)),
        }
    }

    pub async fn run(&self, plan: &Plan, sink: Arc<dyn MarkerSink>) -> RunReport {
        let mut machine = TestStateMachine::new(plan.name.clone(), sink);
        let mut capabilities = BTreeMap::new();
        let mut configurations = Vec::new();

        let patterns = match plan.validate().and_then(|_| plan.field_patterns()) {
            Ok(p) => p,
            Err(e) => {
                warn!(plan = %plan.name, error = %e, "plan rejected");
                let _ = machine.reject(e.to_string()).await;
                return RunReport {
                    state: machine.into_state(),
                    capabilities,
                    configurations,
                };
            }
        };

        if let Err(e) = machine.start().await {
            warn!(plan = %plan.name, error = %e, "could not start run");
        }

        if let Err(e) = self.prepare(plan, &mut capabilities, &mut machine).await {
            warn!(plan = %plan.name, error = %e, "run aborted before workloads");
            let _ = machine.abort(e.to_string()).await;
        }

        if machine.status() == RunStatus::Running {
            for configuration in plan.configurations() {
                let (report, fatal) = self.run_configuration(plan, &configuration, &patterns).await;
                machine.record(report.verdict.clone());
                configurations.push(report);
                if let Some(e) = fatal {
                    warn!(plan = %plan.name, %configuration, error = %e, "aborting run");
                    let _ = machine.abort(e.to_string()).await;
                    break;
                }
            }
        }

        if machine.status() == RunStatus::Running {
            let _ = machine.finish().await;
        }

        RunReport {
            state: machine.into_state(),
            capabilities,
            configurations,
        }
    }

    /// Capability check and setup. Skips the run through `machine` when a
    /// host lacks a required feature.
    async fn prepare(
        &self,
        plan: &Plan,
        capabilities: &mut BTreeMap<String, HostCapabilities>,
        machine: &mut TestStateMachine,
    ) -> Result<(), OrchestrationError> {
        *capabilities = self.resolve_capabilities(plan).await?;

        let mut missing = Vec::new();
        for host in &plan.hosts {
            let caps = capabilities.get(&host.name).cloned().unwrap_or_default();
            for feature in caps.missing(&plan.required_features) {
                missing.push(format!("{} lacks {}", host.name, feature));
            }
        }
        if !missing.is_empty() {
            let reason = missing.join(", ");
            info!(plan = %plan.name, %reason, "required capability missing");
            let _ = machine.skip(reason).await;
            return Ok(());
        }

        for step in &plan.setup {
            let host = lookup(plan, &step.host)?;
            let deadline = step
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.command_timeout);
            let result = self.exec_blocking(host, &step.command, deadline).await?;
            if !result.is_success() {
                return Err(OrchestrationError::RemoteCommand {
                    phase: Phase::Setup,
                    host: host.name.clone(),
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                });
            }
            debug!(host = %host.name, command = %step.command, "setup step done");
        }
        Ok(())
    }

    async fn resolve_capabilities(
        &self,
        plan: &Plan,
    ) -> Result<BTreeMap<String, HostCapabilities>, OrchestrationError> {
        let mut resolved = BTreeMap::new();
        for host in &plan.hosts {
            let caps = match &host.capabilities {
                Some(caps) => caps.clone(),
                None if plan.required_features.is_empty() => continue,
                None => self.probe_capabilities(host, plan).await?,
            };
            info!(
                host = %host.name,
                distro = %caps.distro,
                version = %caps.version,
                kernel = %caps.kernel,
                features = ?caps.features,
                "capabilities resolved"
            );
            resolved.insert(host.name.clone(), caps);
        }
        Ok(resolved)
    }

    async fn probe_capabilities(
        &self,
        host: &Host,
        plan: &Plan,
    ) -> Result<HostCapabilities, OrchestrationError> {
        let probe = self
            .exec_blocking(host, "cat /etc/os-release; echo; uname -r", self.command_timeout)
            .await?;
        let mut caps = HostCapabilities::from_probe_output(&probe.stdout);
        for (feature, command) in &plan.feature_probes {
            let result = self.exec_blocking(host, command, self.command_timeout).await?;
            if result.is_success() {
                caps.features.insert(feature.clone());
            }
        }
        Ok(caps)
    }

    async fn exec_blocking(
        &self,
        host: &Host,
        command: &str,
        deadline: Duration,
    ) -> Result<RemoteCommandResult, RemoteError> {
        let attempt = execute_with_retry(
            self.executor.as_ref(),
            self.clock.as_ref(),
            &self.retry,
            host,
            command,
            ExecMode::Blocking,
        );
        with_deadline(host, deadline, attempt).await
    }

    /// One sub-test. The error, if any, is fatal to the whole run.
    async fn run_configuration(
        &self,
        plan: &Plan,
        configuration: &TestConfiguration,
        patterns: &[FieldPattern],
    ) -> (ConfigurationReport, Option<OrchestrationError>) {
        let name = format!("{}[{}]", plan.name, configuration);
        info!(plan = %plan.name, %configuration, "configuration started");

        let mut started = Vec::new();
        let driven = self.drive(plan, configuration, &mut started).await;

        // Stop everything that was launched, whatever happened above.
        let grace = Duration::from_secs(plan.grace_secs);
        let results = terminate_all(self.executor.as_ref(), self.clock.as_ref(), &started, grace).await;
        let terminations: Vec<TerminationRecord> = started
            .iter()
            .zip(results)
            .map(|(t, r)| TerminationRecord {
                host: t.host.name.clone(),
                process: t.process.clone(),
                outcome: r.as_ref().ok().copied(),
                error: r.err().map(|e| e.to_string()),
            })
            .collect();

        let mut report = ConfigurationReport {
            configuration: configuration.clone(),
            verdict: SubTestVerdict::passed(&name),
            criteria: Vec::new(),
            terminations,
            samples: 0,
        };

        let outcome = match driven {
            Ok(Some(verdict)) => Ok(verdict),
            Ok(None) => {
                self.evaluate(plan, configuration, patterns, &name, &mut report)
                    .await
            }
            Err(e) => Err(e),
        };

        let fatal = match outcome {
            Ok(verdict) => {
                report.verdict = verdict;
                None
            }
            Err(e) => {
                let status = e.disposition();
                report.verdict = match status {
                    RunStatus::Failed => SubTestVerdict::failed(&name, e.to_string()),
                    _ => SubTestVerdict::aborted(&name, e.to_string()),
                };
                (status == RunStatus::Aborted).then_some(e)
            }
        };
        info!(
            plan = %plan.name,
            %configuration,
            verdict = %report.verdict.verdict,
            "configuration finished"
        );
        (report, fatal)
    }

    /// Launch and run the workloads. `Ok(Some(_))` ends the sub-test early
    /// with that verdict; `Ok(None)` means the logs are ready to judge.
    async fn drive(
        &self,
        plan: &Plan,
        configuration: &TestConfiguration,
        started: &mut Vec<TerminationTarget>,
    ) -> Result<Option<SubTestVerdict>, OrchestrationError> {
        let name = format!("{}[{}]", plan.name, configuration);
        let store = self.marker_store();
        let poller = ReadinessPoller::new(&store, self.clock.as_ref());
        let groups = plan.launch_groups();
        let mut any_detached = false;

        for (index, group) in groups.iter().enumerate() {
            // stale markers from an earlier configuration must not count
            for w in group.iter().filter(|w| w.ready_marker().is_some()) {
                let host = lookup(plan, &w.host)?;
                self.exec_blocking(
                    host,
                    &format!("rm -f {}", shell_quote(store.path())),
                    self.command_timeout,
                )
                .await?;
            }

            let launches = group.iter().map(|w| self.launch(plan, w, configuration));
            let mut blocking_verdict = None;
            for (w, result) in group.iter().zip(join_all(launches).await) {
                let host = lookup(plan, &w.host)?;
                if w.mode == WorkloadMode::Detached {
                    any_detached = true;
                    let target = TerminationTarget {
                        host: host.clone(),
                        process: w.process.clone(),
                    };
                    if !started
                        .iter()
                        .any(|t| t.host.name == target.host.name && t.process == target.process)
                    {
                        started.push(target);
                    }
                }
                match result? {
                    Some(v) if blocking_verdict.is_none() => blocking_verdict = Some(v),
                    _ => {}
                }
            }
            if let Some(v) = blocking_verdict {
                return Ok(Some(v));
            }

            let waiter = &poller;
            let waits = group.iter().filter_map(move |w| {
                let marker = w.ready_marker()?;
                let host = plan.host(&w.host)?;
                let spec = WaitSpec::accept(vec![marker]);
                Some(async move { (host, waiter.wait_for_state(host, &spec, &self.poll).await) })
            });
            for (host, result) in join_all(waits).await {
                match result {
                    PollResult::Ready { marker, elapsed, .. } => {
                        info!(host = %host.name, %marker, ?elapsed, "workload ready");
                    }
                    PollResult::RemoteFailed { marker, .. } => {
                        warn!(host = %host.name, %marker, "remote peer reported failure");
                        let reason = format!("{} reported {}", host.name, marker);
                        return Ok(Some(match marker {
                            StateMarker::TestAborted => SubTestVerdict::aborted(&name, reason),
                            StateMarker::TestSkipped => SubTestVerdict::skipped(&name, reason),
                            _ => SubTestVerdict::failed(&name, reason),
                        }));
                    }
                    PollResult::TimedOut { last_seen, .. } => {
                        return Err(OrchestrationError::Timeout {
                            host: host.name.clone(),
                            waiting_for: format!(
                                "readiness (last marker: {})",
                                last_seen.map_or("none".to_string(), |m| m.to_string())
                            ),
                            timeout: self.poll.timeout,
                        });
                    }
                }
            }

            let is_last = index + 1 == groups.len();
            let unconfirmed = group
                .iter()
                .any(|w| w.mode == WorkloadMode::Detached && w.ready_marker().is_none());
            if !is_last && unconfirmed {
                debug!(group = index, settle_secs = plan.settle_secs, "settling");
                self.clock.sleep(Duration::from_secs(plan.settle_secs)).await;
            }
        }

        if any_detached {
            info!(plan = %plan.name, workload_secs = plan.workload_secs, "workloads running");
            self.clock.sleep(Duration::from_secs(plan.workload_secs)).await;
        }
        Ok(None)
    }

    /// Start one workload. Blocking workloads may produce a verdict of
    /// their own.
    async fn launch(
        &self,
        plan: &Plan,
        workload: &Workload,
        configuration: &TestConfiguration,
    ) -> Result<Option<SubTestVerdict>, OrchestrationError> {
        let host = lookup(plan, &workload.host)?;
        let command = render(&workload.command, configuration);
        match workload.mode {
            WorkloadMode::Detached => {
                execute_with_retry(
                    self.executor.as_ref(),
                    self.clock.as_ref(),
                    &self.retry,
                    host,
                    &command,
                    ExecMode::Detached,
                )
                .await?;
                info!(host = %host.name, process = %workload.process, "workload launched");
                Ok(None)
            }
            WorkloadMode::Blocking => {
                let result = self.exec_blocking(host, &command, self.command_timeout).await?;
                let name = format!("{}[{}]", plan.name, configuration);
                if workload.legacy_exit_codes {
                    let code = result.exit_code.unwrap_or(-1);
                    let verdict = SubTestVerdict::from_exit_code(name, code);
                    return Ok((verdict.verdict != Verdict::Passed).then_some(verdict));
                }
                if !result.is_success() {
                    return Err(OrchestrationError::RemoteCommand {
                        phase: Phase::Workload,
                        host: host.name.clone(),
                        exit_code: result.exit_code,
                        stderr: result.stderr.trim().to_string(),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Read logs of stopped workloads and judge the criteria.
    async fn evaluate(
        &self,
        plan: &Plan,
        configuration: &TestConfiguration,
        patterns: &[FieldPattern],
        name: &str,
        report: &mut ConfigurationReport,
    ) -> Result<SubTestVerdict, OrchestrationError> {
        for t in &report.terminations {
            if let Some(error) = &t.error {
                return Err(OrchestrationError::Connection {
                    host: t.host.clone(),
                    reason: error.clone(),
                });
            }
        }

        let mut metrics = MetricSet::new();
        for w in plan.workloads.iter().filter(|w| w.log.is_some()) {
            let host = lookup(plan, &w.host)?;
            let survived = report.terminations.iter().any(|t| {
                t.host == host.name
                    && t.process == w.process
                    && t.outcome == Some(TerminationOutcome::StillRunning)
            });
            if survived {
                return Ok(SubTestVerdict::aborted(
                    name,
                    format!("{} on {} survived SIGKILL; log not read", w.process, host.name),
                ));
            }

            let path = render(w.log.as_deref().unwrap_or_default(), configuration);
            match collect_remote_log(self.executor.as_ref(), host, configuration, &path, patterns).await {
                Ok(samples) => metrics.extend(samples),
                Err(MetricError::Remote(e)) => return Err(e.into()),
                Err(e) => warn!(host = %host.name, %path, error = %e, "log unavailable, no samples"),
            }
        }

        report.samples = metrics.samples().len();
        let (verdict, results) = judge(name, &plan.criteria, &metrics, configuration);
        report.criteria = results;
        Ok(verdict)
    }
}

fn lookup<'a>(plan: &'a Plan, name: &str) -> Result<&'a Host, OrchestrationError> {
    plan.host(name)
        .ok_or_else(|| OrchestrationError::InvalidInput(format!("unknown host '{}'", name)))
}
