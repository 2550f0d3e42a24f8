//! Run plan: hosts, setup, workloads, fields, criteria and the
//! configurations to sweep. Loaded from TOML.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;
use crate::host::Host;
use crate::marker::StateMarker;
use crate::metrics::criteria::Criterion;
use crate::metrics::{FieldPattern, SampleFilters, TestConfiguration};
use crate::remote::terminate::check_process_name;

fn default_workload_secs() -> u64 {
    60
}

fn default_settle_secs() -> u64 {
    5
}

fn default_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    /// How long workloads overlap before they are stopped.
    #[serde(default = "default_workload_secs")]
    pub workload_secs: u64,
    /// Wait after launching a group that has no readiness marker.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Time a process gets to exit after each signal.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Host that receives the run's own state marker. Local file if unset.
    #[serde(default)]
    pub marker_host: Option<String>,
    /// Every host must have all of these or the run is skipped.
    #[serde(default)]
    pub required_features: Vec<String>,
    /// Feature name to a command that exits 0 when the feature is present.
    #[serde(default)]
    pub feature_probes: BTreeMap<String, String>,
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub setup: Vec<SetupStep>,
    #[serde(default)]
    pub workloads: Vec<Workload>,
    /// Custom fields. Criteria on fields not listed here use the presets.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub configurations: Vec<TestConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupStep {
    pub host: String,
    pub command: String,
    /// Overrides the executor's command timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// How a workload is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadMode {
    /// Started in the background, stopped after the workload duration.
    #[default]
    Detached,
    /// Run to completion; its exit status is part of the verdict.
    Blocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub host: String,
    /// May contain `{connections}`, `{cores}` and `{mode}`.
    pub command: String,
    /// Log the workload writes; parsed after it is stopped.
    #[serde(default)]
    pub log: Option<String>,
    /// Process name used to verify and stop the workload.
    pub process: String,
    /// Marker token the workload writes once it is serving.
    #[serde(default)]
    pub ready_marker: Option<String>,
    /// Lower orders are confirmed started before higher orders launch.
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub mode: WorkloadMode,
    /// Blocking only: read the exit status as 0 pass, 1 fail, 2 skip,
    /// anything else abort.
    #[serde(default)]
    pub legacy_exit_codes: bool,
}

impl Workload {
    pub fn ready_marker(&self) -> Option<StateMarker> {
        self.ready_marker.as_deref().and_then(StateMarker::parse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Regex with one capture group. The preset of the same name if unset.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub discard_leading_zeroes: bool,
    #[serde(default)]
    pub trim_edges: bool,
}

impl FieldSpec {
    fn to_pattern(&self) -> Result<FieldPattern, OrchestrationError> {
        let base = match &self.pattern {
            Some(p) => FieldPattern::new(self.name.clone(), p)?,
            None => FieldPattern::preset(&self.name)?,
        };
        Ok(base.with_filters(SampleFilters {
            discard_leading_zeroes: self.discard_leading_zeroes,
            trim_edges: self.trim_edges,
        }))
    }
}

/// Substitute configuration parameters into a command or path.
pub fn render(template: &str, configuration: &TestConfiguration) -> String {
    let mut out = template.to_string();
    if let Some(c) = configuration.connections {
        out = out.replace("{connections}", &c.to_string());
    }
    if let Some(c) = configuration.cores {
        out = out.replace("{cores}", &c.to_string());
    }
    if let Some(m) = &configuration.mode {
        out = out.replace("{mode}", m);
    }
    out
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        let plan: Plan = toml::from_str(&content)
            .with_context(|| format!("failed to parse plan file {}", path.display()))?;
        Ok(plan)
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Check that the plan can be run at all.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        let invalid = |msg: String| Err(OrchestrationError::InvalidInput(msg));

        if self.name.trim().is_empty() {
            return invalid("plan name cannot be empty".to_string());
        }
        if self.hosts.is_empty() {
            return invalid("plan has no hosts".to_string());
        }
        let mut names = HashSet::new();
        for host in &self.hosts {
            host.validate().map_err(OrchestrationError::InvalidInput)?;
            if !names.insert(host.name.as_str()) {
                return invalid(format!("duplicate host name '{}'", host.name));
            }
        }
        if self.workloads.is_empty() {
            return invalid("plan has no workloads".to_string());
        }
        for step in &self.setup {
            if self.host(&step.host).is_none() {
                return invalid(format!("setup refers to unknown host '{}'", step.host));
            }
        }
        for w in &self.workloads {
            if self.host(&w.host).is_none() {
                return invalid(format!("workload refers to unknown host '{}'", w.host));
            }
            if w.command.trim().is_empty() {
                return invalid(format!("workload on '{}' has no command", w.host));
            }
            if w.process.trim().is_empty() {
                return invalid(format!("workload on '{}' has no process name", w.host));
            }
            if let Err(e) = check_process_name(&w.process) {
                return invalid(format!("workload on '{}': {}", w.host, e));
            }
        }
        if let Some(name) = &self.marker_host {
            if self.host(name).is_none() {
                return invalid(format!("marker_host '{}' is not a plan host", name));
            }
        }
        for feature in &self.required_features {
            let declared = self
                .hosts
                .iter()
                .all(|h| h.capabilities.is_some())
                || self.feature_probes.contains_key(feature);
            if !declared {
                return invalid(format!("no probe for required feature '{}'", feature));
            }
        }
        self.field_patterns()?;
        Ok(())
    }

    /// Patterns for every declared field plus presets for criteria fields
    /// that were not declared.
    pub fn field_patterns(&self) -> Result<Vec<FieldPattern>, OrchestrationError> {
        let mut patterns = Vec::new();
        for spec in &self.fields {
            patterns.push(spec.to_pattern()?);
        }
        for criterion in &self.criteria {
            if !patterns.iter().any(|p: &FieldPattern| p.name == criterion.field) {
                patterns.push(FieldPattern::preset(&criterion.field)?);
            }
        }
        Ok(patterns)
    }

    /// Configurations to sweep; one default configuration when none given.
    pub fn configurations(&self) -> Vec<TestConfiguration> {
        if self.configurations.is_empty() {
            vec![TestConfiguration::default()]
        } else {
            self.configurations.clone()
        }
    }

    /// Workloads grouped by launch order, lowest first.
    pub fn launch_groups(&self) -> Vec<Vec<&Workload>> {
        let mut groups: BTreeMap<u32, Vec<&Workload>> = BTreeMap::new();
        for w in &self.workloads {
            groups.entry(w.order).or_default().push(w);
        }
        groups.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Role;

    const PLAN: &str = r#"
name = "dpdk-testpmd-fwd"
workload_secs = 120

[[hosts]]
name = "receiver"
address = "10.0.0.5"
role = "receiver"

[[hosts]]
name = "sender"
address = "10.0.0.4"
role = "sender"

[[setup]]
host = "receiver"
command = "modprobe uio_hv_generic"

[[workloads]]
host = "receiver"
command = "dpdk-testpmd --forward-mode=rxonly -l 0-{cores}"
log = "/tmp/testpmd-rx-{cores}.log"
process = "dpdk-testpmd"
ready_marker = "TestRunning"

[[workloads]]
host = "sender"
command = "dpdk-testpmd --forward-mode={mode}"
log = "/tmp/testpmd-tx.log"
process = "dpdk-testpmd"
order = 1

[[criteria]]
role = "sender"
field = "tx_pps"
min = 1000000

[[configurations]]
cores = 4
mode = "txonly"
"#;

    fn plan() -> Plan {
        toml::from_str(PLAN).unwrap()
    }

    #[test]
    fn test_parse_plan() {
        let p = plan();
        assert_eq!(p.workload_secs, 120);
        assert_eq!(p.settle_secs, 5);
        assert_eq!(p.hosts[1].role, Role::Sender);
        assert_eq!(p.workloads[0].ready_marker(), Some(StateMarker::TestRunning));
        assert_eq!(p.workloads[1].ready_marker(), None);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(&path, PLAN).unwrap();
        let p = Plan::load(&path).unwrap();
        assert_eq!(p.name, "dpdk-testpmd-fwd");
        assert!(Plan::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_launch_groups_in_order() {
        let p = plan();
        let groups = p.launch_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].host, "receiver");
        assert_eq!(groups[1][0].host, "sender");
    }

    #[test]
    fn test_render_placeholders() {
        let p = plan();
        let cfg = &p.configurations()[0];
        assert_eq!(
            render(&p.workloads[0].command, cfg),
            "dpdk-testpmd --forward-mode=rxonly -l 0-4"
        );
        assert_eq!(render("ntttcp -P {connections}", cfg), "ntttcp -P {connections}");
    }

    #[test]
    fn test_criteria_fields_fall_back_to_presets() {
        let p = plan();
        let patterns = p.field_patterns().unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].name, "tx_pps");
        assert_eq!(patterns[0].filters, SampleFilters::default());
    }

    #[test]
    fn test_declared_field_opts_into_filters() {
        let mut p: Plan = toml::from_str(&format!(
            "{}\n[[fields]]\nname = \"tx_pps\"\ntrim_edges = true\n",
            PLAN
        ))
        .unwrap();
        let patterns = p.field_patterns().unwrap();
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].filters.trim_edges);
        assert!(!patterns[0].filters.discard_leading_zeroes);

        p.fields[0].discard_leading_zeroes = true;
        assert!(p.field_patterns().unwrap()[0].filters.discard_leading_zeroes);
    }

    #[test]
    fn test_process_name_must_fit_comm() {
        let mut p = plan();
        p.workloads[0].process = "dpdk-testpmd-fwd0".to_string();
        let err = p.validate().unwrap_err().to_string();
        assert!(err.contains("truncates"), "{}", err);

        p.workloads[0].process = "dpdk-testpmd-fw".to_string();
        assert!(p.validate().is_ok());

        p.workloads[0].process = "netperf -H".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut p = plan();
        p.hosts.clear();
        assert!(matches!(p.validate(), Err(OrchestrationError::InvalidInput(_))));

        let mut p = plan();
        p.hosts[0].address = "-oProxyCommand=evil".to_string();
        assert!(p.validate().is_err());

        let mut p = plan();
        p.workloads[0].host = "ghost".to_string();
        assert!(p.validate().is_err());

        let mut p = plan();
        p.hosts[1].name = "receiver".to_string();
        assert!(p.validate().is_err());

        let mut p = plan();
        p.criteria[0].field = "not_a_preset".to_string();
        assert!(p.validate().is_err());

        let mut p = plan();
        p.required_features.push("sriov".to_string());
        assert!(p.validate().is_err());
        p.feature_probes
            .insert("sriov".to_string(), "lspci | grep -q 'Virtual Function'".to_string());
        assert!(p.validate().is_ok());
    }
}
