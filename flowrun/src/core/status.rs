//! Step and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not been scheduled yet.
    #[default]
    Pending,
    /// Step is currently executing.
    Running,
    /// Step produced its outputs (executed, served from cache, or resumed).
    Completed,
    /// Step was skipped by condition logic.
    Skipped,
    /// Step failed after the resilience policy gave up.
    Failed,
    /// Step was not executed because an upstream step failed.
    DependencyFailed,
    /// Step was never dispatched because the run was cancelled.
    NotStarted,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::DependencyFailed => write!(f, "dependency_failed"),
            Self::NotStarted => write!(f, "not_started"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status will not change again during the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if downstream steps may consume this step's result.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Returns true if the status counts as a failure of the run.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::DependencyFailed)
    }
}

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is in progress.
    #[default]
    Running,
    /// Every step completed or was validly skipped.
    Completed,
    /// At least one step failed, or the run was cancelled.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true once the run has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_display() {
        assert_eq!(StepStatus::Completed.to_string(), "completed");
        assert_eq!(StepStatus::DependencyFailed.to_string(), "dependency_failed");
        assert_eq!(StepStatus::NotStarted.to_string(), "not_started");
    }

    #[test]
    fn test_step_status_predicates() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_success());
        assert!(StepStatus::DependencyFailed.is_failure());
        assert!(!StepStatus::NotStarted.is_failure());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&StepStatus::DependencyFailed).unwrap();
        assert_eq!(json, r#""dependency_failed""#);

        let status: RunStatus = serde_json::from_str(r#""completed""#).unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert!(status.is_terminal());
    }
}
