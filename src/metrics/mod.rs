//! Metric collection: pull numeric fields out of workload logs and reduce
//! them per test configuration.

pub mod criteria;
pub mod reduce;
pub mod report;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::host::{Host, Role};
use crate::remote::{shell_quote, ExecMode, RemoteError, RemoteExecutor};

pub use reduce::{ratio, reduce, reduce_values, CrossRole, CrossRoleReduced, Derived, Reduced, Reduction};

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("invalid pattern for field {field}: {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("pattern for field {field} must have exactly one capture group")]
    MissingCapture { field: String },

    #[error("unknown field preset '{0}'")]
    UnknownPreset(String),

    #[error("failed to read log {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch log {path} from {host}: {reason}")]
    Fetch {
        host: String,
        path: String,
        reason: String,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Workload parameters a sample was produced under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestConfiguration {
    #[serde(default)]
    pub connections: Option<u32>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl fmt::Display for TestConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(c) = self.connections {
            parts.push(format!("connections={}", c));
        }
        if let Some(c) = self.cores {
            parts.push(format!("cores={}", c));
        }
        if let Some(m) = &self.mode {
            parts.push(format!("mode={}", m));
        }
        if parts.is_empty() {
            write!(f, "default")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// One numeric value parsed from one log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub role: Role,
    /// Log the sample came from, `host:path` for remote logs. Hosts sharing
    /// a role are told apart by this.
    pub source: String,
    pub configuration: TestConfiguration,
    pub field: String,
    pub value: f64,
    /// 1-based line number in the source log.
    pub line: usize,
    /// Leading RFC 3339 timestamp on the line, if it had one.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Which samples of a field to drop before reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFilters {
    /// Drop the run of zeros a tool prints before traffic starts. Kept when
    /// every sample is zero.
    #[serde(default)]
    pub discard_leading_zeroes: bool,
    /// Drop the first and last sample (ramp-up and teardown) when at least
    /// three exist.
    #[serde(default)]
    pub trim_edges: bool,
}

impl SampleFilters {
    /// Range of `values` that survives the filters.
    pub fn keep_range(&self, values: &[f64]) -> std::ops::Range<usize> {
        let mut lo = 0;
        let mut hi = values.len();
        if self.discard_leading_zeroes {
            if let Some(first) = values.iter().position(|v| *v != 0.0) {
                lo = first;
            }
        }
        if self.trim_edges && hi - lo >= 3 {
            lo += 1;
            hi -= 1;
        }
        lo..hi
    }
}

/// A named field and the regex that extracts it. Capture group 1 is the number.
#[derive(Debug, Clone)]
pub struct FieldPattern {
    pub name: String,
    regex: Regex,
    pub filters: SampleFilters,
}

impl FieldPattern {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, MetricError> {
        let name = name.into();
        let regex = Regex::new(pattern).map_err(|source| MetricError::InvalidPattern {
            field: name.clone(),
            source,
        })?;
        // captures_len counts the implicit whole-match group
        if regex.captures_len() != 2 {
            return Err(MetricError::MissingCapture { field: name });
        }
        Ok(Self {
            name,
            regex,
            filters: SampleFilters::default(),
        })
    }

    pub fn with_filters(mut self, filters: SampleFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Built-in patterns for the tools the test suites drive.
    pub fn preset(name: &str) -> Result<Self, MetricError> {
        let pattern = match name {
            "tx_pps" => r"Tx-pps:\s+([0-9]+)",
            "rx_pps" => r"Rx-pps:\s+([0-9]+)",
            "tx_bytes" => r"TX-bytes:\s+([0-9]+)",
            "rx_bytes" => r"RX-bytes:\s+([0-9]+)",
            "tx_packets" => r"TX-packets:\s+([0-9]+)",
            "rx_packets" => r"RX-packets:\s+([0-9]+)",
            "throughput_gbps" => r"throughput\s*:\s*([0-9]+(?:\.[0-9]+)?)\s*Gbps",
            "latency_us" => r"[Ll]atency\s*(?:\(us\))?\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)",
            other => return Err(MetricError::UnknownPreset(other.to_string())),
        };
        // no filters here; ramp trimming is opted into per field
        FieldPattern::new(name, pattern)
    }
}

fn leading_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split_whitespace().next()?;
    let token = token.trim_start_matches('[').trim_end_matches(']');
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract every match of every pattern, in text order, then apply each
/// pattern's filters to its own field. Deterministic for a given input.
pub fn parse_text(
    role: &Role,
    source: &str,
    configuration: &TestConfiguration,
    text: &str,
    patterns: &[FieldPattern],
) -> Vec<MetricSample> {
    let mut raw = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let mut timestamp = None;
        let mut checked_timestamp = false;
        for pattern in patterns {
            for caps in pattern.regex.captures_iter(line) {
                let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
                    continue;
                };
                if !checked_timestamp {
                    timestamp = leading_timestamp(line);
                    checked_timestamp = true;
                }
                raw.push(MetricSample {
                    role: role.clone(),
                    source: source.to_string(),
                    configuration: configuration.clone(),
                    field: pattern.name.clone(),
                    value,
                    line: idx + 1,
                    timestamp,
                });
            }
        }
    }

    let mut keep = vec![true; raw.len()];
    for pattern in patterns {
        let indices: Vec<usize> = raw
            .iter()
            .enumerate()
            .filter(|(_, s)| s.field == pattern.name)
            .map(|(i, _)| i)
            .collect();
        let values: Vec<f64> = indices.iter().map(|&i| raw[i].value).collect();
        let range = pattern.filters.keep_range(&values);
        for (pos, &i) in indices.iter().enumerate() {
            if !range.contains(&pos) {
                keep[i] = false;
            }
        }
    }

    raw.into_iter()
        .zip(keep)
        .filter_map(|(s, k)| k.then_some(s))
        .collect()
}

/// Parse a log file on the local filesystem.
pub fn parse_log(
    role: &Role,
    configuration: &TestConfiguration,
    path: &Path,
    patterns: &[FieldPattern],
) -> Result<Vec<MetricSample>, MetricError> {
    let bytes = std::fs::read(path).map_err(|source| MetricError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let source = path.display().to_string();
    let samples = parse_text(role, &source, configuration, &text, patterns);
    debug!(path = %path.display(), %role, samples = samples.len(), "parsed log");
    Ok(samples)
}

/// Fetch a log from a host and parse it. The producing process must already
/// be stopped so the file is complete.
pub async fn collect_remote_log(
    executor: &dyn RemoteExecutor,
    host: &Host,
    configuration: &TestConfiguration,
    path: &str,
    patterns: &[FieldPattern],
) -> Result<Vec<MetricSample>, MetricError> {
    let result = executor
        .execute(host, &format!("cat {}", shell_quote(path)), ExecMode::Blocking)
        .await?;
    if !result.is_success() {
        return Err(MetricError::Fetch {
            host: host.name.clone(),
            path: path.to_string(),
            reason: result.stderr.trim().to_string(),
        });
    }
    let source = format!("{}:{}", host.name, path);
    let samples = parse_text(&host.role, &source, configuration, &result.stdout, patterns);
    debug!(host = %host.name, %path, samples = samples.len(), "collected remote log");
    Ok(samples)
}

/// All samples gathered during one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricSet {
    samples: Vec<MetricSample>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = MetricSample>) {
        self.samples.extend(samples);
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples of `field`, optionally limited to one role and configuration.
    pub fn select(
        &self,
        field: &str,
        role: Option<&Role>,
        configuration: Option<&TestConfiguration>,
    ) -> Vec<MetricSample> {
        self.samples
            .iter()
            .filter(|s| s.field == field)
            .filter(|s| role.map_or(true, |r| &s.role == r))
            .filter(|s| configuration.map_or(true, |c| &s.configuration == c))
            .cloned()
            .collect()
    }

    /// Reduce each source's samples of `field` on its own, keyed by role
    /// and source. Raw samples from different logs are never pooled.
    fn reduce_by_source(
        &self,
        field: &str,
        role: Option<&Role>,
        configuration: Option<&TestConfiguration>,
        per_source: Reduction,
    ) -> BTreeMap<Role, Vec<Reduced>> {
        let mut grouped: BTreeMap<(Role, String), Vec<f64>> = BTreeMap::new();
        for s in self.select(field, role, configuration) {
            grouped.entry((s.role, s.source)).or_default().push(s.value);
        }
        let mut by_role: BTreeMap<Role, Vec<Reduced>> = BTreeMap::new();
        for ((role, _), values) in grouped {
            by_role
                .entry(role)
                .or_default()
                .push(reduce_values(&values, per_source));
        }
        by_role
    }

    /// Reduce each source of one role with `per_source`, then combine the
    /// sources with `across`.
    pub fn reduce_role(
        &self,
        field: &str,
        role: &Role,
        configuration: Option<&TestConfiguration>,
        per_source: Reduction,
        across: CrossRole,
    ) -> Reduced {
        self.reduce_by_source(field, Some(role), configuration, per_source)
            .remove(role)
            .map_or_else(Reduced::empty, |parts| across.combine(&parts))
    }

    /// Reduce each source with `per_source`, combine the sources of a role
    /// with `across`, then combine the roles with `across`.
    pub fn reduce_across_roles(
        &self,
        field: &str,
        configuration: Option<&TestConfiguration>,
        per_source: Reduction,
        across: CrossRole,
    ) -> CrossRoleReduced {
        let per_role: BTreeMap<Role, Reduced> = self
            .reduce_by_source(field, None, configuration, per_source)
            .into_iter()
            .map(|(role, parts)| (role, across.combine(&parts)))
            .collect();
        CrossRoleReduced::combine(per_role, across)
    }

    /// Distinct configurations in first-seen order.
    pub fn configurations(&self) -> Vec<TestConfiguration> {
        let mut seen = Vec::new();
        for s in &self.samples {
            if !seen.contains(&s.configuration) {
                seen.push(s.configuration.clone());
            }
        }
        seen
    }
}
