//! Sub-test verdicts and the precedence table that folds them into one
//! final verdict.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Skipped,
    Aborted,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
            Verdict::Skipped => "skipped",
            Verdict::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passed" | "pass" => Ok(Verdict::Passed),
            "failed" | "fail" => Ok(Verdict::Failed),
            "skipped" | "skip" => Ok(Verdict::Skipped),
            "aborted" | "abort" => Ok(Verdict::Aborted),
            other => Err(format!("unknown verdict '{}'", other)),
        }
    }
}

/// The outcome of one independently run sub-test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTestVerdict {
    pub name: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SubTestVerdict {
    pub fn new(name: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            name: name.into(),
            verdict,
            reason: None,
        }
    }

    pub fn passed(name: impl Into<String>) -> Self {
        Self::new(name, Verdict::Passed)
    }

    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(name, Verdict::Failed).with_reason(reason)
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(name, Verdict::Skipped).with_reason(reason)
    }

    pub fn aborted(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(name, Verdict::Aborted).with_reason(reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Map a legacy script status code: 0 pass, 1 fail, 2 skip, else abort.
    pub fn from_exit_code(name: impl Into<String>, code: i32) -> Self {
        let verdict = match code {
            0 => Verdict::Passed,
            1 => Verdict::Failed,
            2 => Verdict::Skipped,
            _ => Verdict::Aborted,
        };
        let v = Self::new(name, verdict);
        if verdict == Verdict::Passed {
            v
        } else {
            v.with_reason(format!("exit code {}", code))
        }
    }
}

/// Verdict for the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalVerdict {
    Completed,
    Failed,
    Skipped,
    Aborted,
}

impl fmt::Display for FinalVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalVerdict::Completed => "completed",
            FinalVerdict::Failed => "failed",
            FinalVerdict::Skipped => "skipped",
            FinalVerdict::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Fold sub-test verdicts, first matching rule wins:
///
/// 1. any `Failed` gives `Failed`;
/// 2. if nothing passed, `Aborted` when any aborted, else `Skipped`;
/// 3. otherwise `Completed`.
///
/// An empty list verified nothing and is `Aborted`. Pure, so repeated calls
/// on the same slice agree.
pub fn aggregate(results: &[SubTestVerdict]) -> FinalVerdict {
    aggregate_verdicts(results.iter().map(|r| r.verdict))
}

pub fn aggregate_verdicts(verdicts: impl IntoIterator<Item = Verdict>) -> FinalVerdict {
    let mut any = false;
    let mut any_failed = false;
    let mut any_passed = false;
    let mut any_aborted = false;
    for v in verdicts {
        any = true;
        match v {
            Verdict::Failed => any_failed = true,
            Verdict::Passed => any_passed = true,
            Verdict::Aborted => any_aborted = true,
            Verdict::Skipped => {}
        }
    }

    if !any {
        return FinalVerdict::Aborted;
    }
    if any_failed {
        return FinalVerdict::Failed;
    }
    if !any_passed {
        return if any_aborted {
            FinalVerdict::Aborted
        } else {
            FinalVerdict::Skipped
        };
    }
    FinalVerdict::Completed
}
