//! Step records and their status state machine.
//!
//! A step is one unit of work in the dependency graph. Its status moves
//! along `pending/queued -> working -> {success, error}`; any non-terminal
//! status can move to `cancel`, and `success`/`cancel` are terminal unless
//! explicitly revived via reset.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Runnable: all parents (if any) have succeeded.
    Pending,
    /// Blocked behind one or more unfinished parents.
    Queued,
    /// Claimed by a worker within the staleness window.
    Working,
    /// Finished successfully.
    Success,
    /// Finished with an error; revivable via reset.
    Error,
    /// Cancelled, along with its connected component.
    Cancel,
}

impl StepStatus {
    /// Returns the lowercase wire/database name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Queued => "queued",
            StepStatus::Working => "working",
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Cancel => "cancel",
        }
    }

    /// Returns true for statuses that end a step's lifecycle.
    ///
    /// Terminal steps are only revived by an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Cancel)
    }

    /// All statuses, in state-machine order.
    pub fn all() -> [StepStatus; 6] {
        [
            StepStatus::Pending,
            StepStatus::Queued,
            StepStatus::Working,
            StepStatus::Success,
            StepStatus::Error,
            StepStatus::Cancel,
        ]
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "queued" => Ok(StepStatus::Queued),
            "working" => Ok(StepStatus::Working),
            "success" => Ok(StepStatus::Success),
            "error" => Ok(StepStatus::Error),
            "cancel" => Ok(StepStatus::Cancel),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized status name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown step status: '{0}'")]
pub struct UnknownStatus(pub String);

/// A unit of work in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Opaque unique identifier.
    pub id: String,
    /// Higher priorities are dispatched first.
    #[serde(default)]
    pub priority: i64,
    /// Partition label deciding which worker pool may claim this step.
    pub scope: String,
    /// Fairness-grouping label, throttled by velocity.
    pub tag: String,
    /// Per-pass dispatch cap for this step's tag; `None` means unlimited.
    /// Copied onto the step for convenience; the tags table is authoritative.
    #[serde(default)]
    pub velocity: Option<f64>,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Unix timestamp (seconds) of the last status change.
    #[serde(default)]
    pub epoch: i64,
    /// Error message, populated only on error.
    #[serde(default)]
    pub msg: Option<String>,
    /// Error traceback, populated only on error.
    #[serde(default)]
    pub trace: Option<String>,
    /// Step ids that must succeed before this step may run.
    #[serde(default)]
    pub parents: BTreeSet<String>,
    /// Step ids unblocked when this step completes.
    #[serde(default)]
    pub children: BTreeSet<String>,
}

impl Step {
    /// Creates a step with the given id in the given scope/tag, with no
    /// edges and default priority, status pending.
    pub fn new(id: impl Into<String>, scope: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            scope: scope.into(),
            tag: tag.into(),
            velocity: None,
            status: StepStatus::Pending,
            epoch: 0,
            msg: None,
            trace: None,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    /// Sets the dispatch priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-tag velocity cap.
    pub fn with_velocity(mut self, velocity: f64) -> Self {
        self.velocity = Some(velocity);
        self
    }

    /// Adds a parent edge.
    pub fn with_parent(mut self, id: impl Into<String>) -> Self {
        self.parents.insert(id.into());
        self
    }

    /// Adds a child edge.
    pub fn with_child(mut self, id: impl Into<String>) -> Self {
        self.children.insert(id.into());
        self
    }

    /// Returns true when this step has no unmet prerequisites by shape
    /// (no parents at all). Steps with parents start queued.
    pub fn is_starter(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in StepStatus::all() {
            let parsed: StepStatus = status.as_str().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_unknown() {
        let err = "done".parse::<StepStatus>().unwrap_err();
        assert!(err.to_string().contains("done"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Cancel.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Queued.is_terminal());
        assert!(!StepStatus::Working.is_terminal());
        assert!(!StepStatus::Error.is_terminal());
    }

    #[test]
    fn test_step_builder() {
        let step = Step::new("s1", "default", "gpu")
            .with_priority(5)
            .with_velocity(2.0)
            .with_parent("s0")
            .with_child("s2");

        assert_eq!(step.id, "s1");
        assert_eq!(step.priority, 5);
        assert_eq!(step.velocity, Some(2.0));
        assert!(step.parents.contains("s0"));
        assert!(step.children.contains("s2"));
        assert!(!step.is_starter());
    }

    #[test]
    fn test_step_serialization_roundtrip() {
        let step = Step::new("s1", "default", "t1").with_parent("p1");
        let serialized = serde_json::to_string(&step).expect("serialization should work");
        let deserialized: Step =
            serde_json::from_str(&serialized).expect("deserialization should work");
        assert_eq!(step, deserialized);
    }

    #[test]
    fn test_step_deserializes_sparse_json() {
        // Uploads may omit optional fields entirely.
        let step: Step = serde_json::from_str(
            r#"{"id":"a","scope":"default","tag":"t1","status":"pending"}"#,
        )
        .expect("sparse step should deserialize");
        assert_eq!(step.priority, 0);
        assert!(step.parents.is_empty());
        assert!(step.is_starter());
    }
}
