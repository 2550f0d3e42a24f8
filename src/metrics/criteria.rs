//! Pass criteria: bounds on reduced metrics that decide a sub-test verdict.

use serde::{Deserialize, Serialize};

use super::{CrossRole, MetricSet, Reduction, TestConfiguration};
use crate::host::Role;
use crate::outcome::SubTestVerdict;

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Limit to one role. Without it the field is combined across roles.
    /// Either way each log is reduced on its own first, then combined with
    /// `across`.
    #[serde(default)]
    pub role: Option<Role>,
    pub field: String,
    #[serde(default)]
    pub reduction: Reduction,
    #[serde(default)]
    pub across: CrossRole,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Criterion {
    pub fn new(field: impl Into<String>, reduction: Reduction) -> Self {
        Self {
            role: None,
            field: field.into(),
            reduction,
            across: CrossRole::default(),
            min: None,
            max: None,
            required: true,
        }
    }

    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn at_least(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn at_most(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn label(&self) -> String {
        match &self.role {
            Some(role) => format!("{}.{}({})", role, self.field, self.reduction),
            None => format!("{}({})", self.field, self.reduction),
        }
    }

    pub fn evaluate(&self, metrics: &MetricSet, configuration: &TestConfiguration) -> CriterionResult {
        let (value, no_samples) = match &self.role {
            Some(role) => {
                let r = metrics.reduce_role(
                    &self.field,
                    role,
                    Some(configuration),
                    self.reduction,
                    self.across,
                );
                (r.value, r.no_samples)
            }
            None => {
                let r = metrics.reduce_across_roles(
                    &self.field,
                    Some(configuration),
                    self.reduction,
                    self.across,
                );
                (r.value, r.no_samples)
            }
        };

        let status = if no_samples {
            if self.required {
                CriterionStatus::MissingRequired
            } else {
                CriterionStatus::NoSamples
            }
        } else if self.min.is_some_and(|m| value < m) || self.max.is_some_and(|m| value > m) {
            CriterionStatus::OutOfRange
        } else {
            CriterionStatus::Pass
        };

        CriterionResult {
            label: self.label(),
            value,
            min: self.min,
            max: self.max,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Pass,
    OutOfRange,
    /// Optional criterion with nothing to measure; ignored.
    NoSamples,
    /// Required criterion with nothing to measure.
    MissingRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionResult {
    pub label: String,
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub status: CriterionStatus,
}

impl CriterionResult {
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            CriterionStatus::OutOfRange | CriterionStatus::MissingRequired
        )
    }
}

/// Evaluate every criterion for one configuration. The sub-test fails with
/// the first failing criterion as its reason.
pub fn judge(
    name: &str,
    criteria: &[Criterion],
    metrics: &MetricSet,
    configuration: &TestConfiguration,
) -> (SubTestVerdict, Vec<CriterionResult>) {
    let results: Vec<CriterionResult> = criteria
        .iter()
        .map(|c| c.evaluate(metrics, configuration))
        .collect();
    let verdict = match results.iter().find(|r| r.is_failure()) {
        Some(r) if r.status == CriterionStatus::MissingRequired => {
            SubTestVerdict::failed(name, format!("no samples for required metric {}", r.label))
        }
        Some(r) => SubTestVerdict::failed(
            name,
            format!(
                "{} = {} outside [{}, {}]",
                r.label,
                r.value,
                r.min.map_or("-".to_string(), |v| v.to_string()),
                r.max.map_or("-".to_string(), |v| v.to_string()),
            ),
        ),
        None => SubTestVerdict::passed(name),
    };
    (verdict, results)
}
