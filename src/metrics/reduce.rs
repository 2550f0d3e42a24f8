//! Reduction strategies for collected samples.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::MetricSample;
use crate::host::Role;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Max,
    Min,
    #[default]
    Mean,
    Sum,
    Last,
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reduction::Max => "max",
            Reduction::Min => "min",
            Reduction::Mean => "mean",
            Reduction::Sum => "sum",
            Reduction::Last => "last",
        };
        f.write_str(s)
    }
}

impl FromStr for Reduction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(Reduction::Max),
            "min" => Ok(Reduction::Min),
            "mean" | "avg" | "average" => Ok(Reduction::Mean),
            "sum" | "total" => Ok(Reduction::Sum),
            "last" => Ok(Reduction::Last),
            other => Err(format!("unknown reduction '{}'", other)),
        }
    }
}

/// How per-source and per-role results combine into one figure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossRole {
    #[default]
    Sum,
    Mean,
    Max,
}

impl CrossRole {
    /// Combine already-reduced results, ignoring the empty ones. `count`
    /// is the total number of raw samples behind the inputs.
    pub fn combine(&self, parts: &[Reduced]) -> Reduced {
        let values: Vec<f64> = parts
            .iter()
            .filter(|r| !r.no_samples)
            .map(|r| r.value)
            .collect();
        let strategy = match self {
            CrossRole::Sum => Reduction::Sum,
            CrossRole::Mean => Reduction::Mean,
            CrossRole::Max => Reduction::Max,
        };
        let mut combined = reduce_values(&values, strategy);
        combined.count = parts.iter().map(|r| r.count).sum();
        combined
    }
}

/// Result of a reduction. `no_samples` separates "measured zero" from
/// "nothing to measure"; the value is 0.0 in the latter case.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reduced {
    pub value: f64,
    pub count: usize,
    pub no_samples: bool,
}

impl Reduced {
    pub fn empty() -> Self {
        Self {
            value: 0.0,
            count: 0,
            no_samples: true,
        }
    }
}

pub fn reduce_values(values: &[f64], strategy: Reduction) -> Reduced {
    let Some(&last) = values.last() else {
        return Reduced::empty();
    };
    let value = match strategy {
        Reduction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Reduction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Reduction::Sum => values.iter().sum(),
        Reduction::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Reduction::Last => last,
    };
    Reduced {
        value,
        count: values.len(),
        no_samples: false,
    }
}

/// Reduce samples already narrowed to one field. `Last` means last in
/// file order, so callers pass samples in the order they were parsed.
pub fn reduce(samples: &[MetricSample], strategy: Reduction) -> Reduced {
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    reduce_values(&values, strategy)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossRoleReduced {
    pub value: f64,
    pub no_samples: bool,
    pub per_role: BTreeMap<Role, Reduced>,
}

impl CrossRoleReduced {
    pub(crate) fn combine(per_role: BTreeMap<Role, Reduced>, across: CrossRole) -> Self {
        let parts: Vec<Reduced> = per_role.values().copied().collect();
        let combined = across.combine(&parts);
        Self {
            value: combined.value,
            no_samples: combined.no_samples,
            per_role,
        }
    }
}

/// A value computed from other metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Derived {
    Value(f64),
    Undefined,
}

impl Derived {
    pub fn value(&self) -> Option<f64> {
        match self {
            Derived::Value(v) => Some(*v),
            Derived::Undefined => None,
        }
    }
}

impl fmt::Display for Derived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Derived::Value(v) => write!(f, "{:.4}", v),
            Derived::Undefined => f.write_str("undefined"),
        }
    }
}

/// `numerator / denominator`, or `Undefined` when the denominator is zero
/// or either side is not finite.
pub fn ratio(numerator: f64, denominator: f64) -> Derived {
    if denominator == 0.0 || !numerator.is_finite() || !denominator.is_finite() {
        return Derived::Undefined;
    }
    Derived::Value(numerator / denominator)
}
