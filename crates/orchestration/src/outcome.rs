//! Outcome of one fan-out unit and the policy that judges it

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use transport::ErrorClassification;

/// Whether a unit with some failed sub-tasks counts as a success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionPolicy {
    /// Any failed sub-task fails the unit. All sub-tasks still run.
    #[default]
    RequireAll,
    /// The unit succeeds if at least one sub-task succeeded.
    BestEffortAny,
}

impl CompletionPolicy {
    pub fn is_success(&self, total: usize, succeeded: usize) -> bool {
        if total == 0 {
            return true;
        }
        match self {
            CompletionPolicy::RequireAll => succeeded == total,
            CompletionPolicy::BestEffortAny => succeeded > 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CompletionPolicy::RequireAll => "require-all",
            CompletionPolicy::BestEffortAny => "best-effort-any",
        }
    }
}

impl fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CompletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "require-all" => Ok(CompletionPolicy::RequireAll),
            "best-effort-any" => Ok(CompletionPolicy::BestEffortAny),
            other => Err(format!(
                "unknown completion policy '{other}', expected require-all or best-effort-any"
            )),
        }
    }
}

/// One failed sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskError {
    pub label: String,
    /// Set when the failure came from the upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClassification>,
    pub message: String,
}

/// Best-effort, non-transactional summary of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records written to the repository.
    pub records: usize,
    pub errors: Vec<SubtaskError>,
    pub success: bool,
}

impl Default for CollectionOutcome {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionOutcome {
    /// An empty unit, which is a success.
    pub fn new() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            records: 0,
            errors: Vec::new(),
            success: true,
        }
    }

    pub fn record_success(&mut self) {
        self.total += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(
        &mut self,
        label: impl Into<String>,
        classification: Option<ErrorClassification>,
        message: impl Into<String>,
    ) {
        self.total += 1;
        self.failed += 1;
        self.errors.push(SubtaskError {
            label: label.into(),
            classification,
            message: message.into(),
        });
    }

    /// Fold another outcome into this one. `success` is left for `finalize`.
    pub fn merge(&mut self, other: CollectionOutcome) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.records += other.records;
        self.errors.extend(other.errors);
    }

    /// Judge the unit under `policy`.
    pub fn finalize(mut self, policy: CompletionPolicy) -> Self {
        self.success = policy.is_success(self.total, self.succeeded);
        self
    }

    /// One-line description of the first few failures.
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let mut parts: Vec<String> = self
            .errors
            .iter()
            .take(3)
            .map(|e| format!("{}: {}", e.label, e.message))
            .collect();
        if self.errors.len() > 3 {
            parts.push(format!("and {} more", self.errors.len() - 3));
        }
        Some(parts.join("; "))
    }
}
