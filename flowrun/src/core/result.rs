//! Per-step result record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::StepStatus;
use crate::artifacts::ArtifactRef;
use crate::errors::DependencyFailedError;

/// The outcome of one step within a run.
///
/// Outputs are held as [`ArtifactRef`] handles; resolve them through the
/// engine's artifact store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step name.
    pub step: String,
    /// Current status.
    pub status: StepStatus,
    /// Whether the step produced its outputs.
    pub success: bool,
    /// Whether the outputs came from the cache or a prior checkpoint.
    pub cached: bool,
    /// Whether the step was skipped by condition logic.
    pub skipped: bool,
    /// Whether the outputs came from the fallback.
    #[serde(default)]
    pub fallback: bool,
    /// Whether the step was restored from a checkpoint of the same run id.
    #[serde(default)]
    pub resumed: bool,
    /// Number of times the step logic was invoked.
    pub attempts: u32,
    /// Number of invocations rejected by an open circuit.
    #[serde(default)]
    pub circuit_rejections: u32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// Error summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error class of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Why the step was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Produced outputs by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, ArtifactRef>,
    /// Cache key used for this invocation, if caching was enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// When the step started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// Creates a pending result.
    #[must_use]
    pub fn pending(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Pending,
            success: false,
            cached: false,
            skipped: false,
            fallback: false,
            resumed: false,
            attempts: 0,
            circuit_rejections: 0,
            duration_ms: 0.0,
            error: None,
            error_class: None,
            skip_reason: None,
            outputs: BTreeMap::new(),
            cache_key: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Creates a result for a step that executed successfully.
    #[must_use]
    pub fn completed(step: impl Into<String>, outputs: BTreeMap<String, ArtifactRef>) -> Self {
        Self {
            status: StepStatus::Completed,
            success: true,
            outputs,
            finished_at: Some(Utc::now()),
            ..Self::pending(step)
        }
    }

    /// Creates a result for a step served from the cache.
    #[must_use]
    pub fn cached(step: impl Into<String>, outputs: BTreeMap<String, ArtifactRef>) -> Self {
        Self {
            cached: true,
            ..Self::completed(step, outputs)
        }
    }

    /// Creates a result for a step restored from a checkpoint of the same run.
    #[must_use]
    pub fn resumed(step: impl Into<String>, outputs: BTreeMap<String, ArtifactRef>) -> Self {
        Self {
            resumed: true,
            ..Self::cached(step, outputs)
        }
    }

    /// Creates a result for a step skipped by condition logic.
    #[must_use]
    pub fn skipped(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            success: true,
            skipped: true,
            skip_reason: Some(reason.into()),
            finished_at: Some(Utc::now()),
            ..Self::pending(step)
        }
    }

    /// Creates a result for a step whose logic failed.
    #[must_use]
    pub fn failed(
        step: impl Into<String>,
        error: impl Into<String>,
        error_class: impl Into<String>,
    ) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.into()),
            error_class: Some(error_class.into()),
            finished_at: Some(Utc::now()),
            ..Self::pending(step)
        }
    }

    /// Creates a result for a step blocked by a failed upstream step.
    #[must_use]
    pub fn dependency_failed(step: impl Into<String>, upstream: impl Into<String>) -> Self {
        let step = step.into();
        let err = DependencyFailedError::new(step.clone(), upstream);
        Self {
            status: StepStatus::DependencyFailed,
            error: Some(err.to_string()),
            error_class: Some(DependencyFailedError::CLASS.to_string()),
            finished_at: Some(Utc::now()),
            ..Self::pending(step)
        }
    }

    /// Creates a result for a step never dispatched because the run was cancelled.
    #[must_use]
    pub fn not_started(step: impl Into<String>) -> Self {
        Self {
            status: StepStatus::NotStarted,
            finished_at: Some(Utc::now()),
            ..Self::pending(step)
        }
    }

    /// Sets the attempt counters.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32, circuit_rejections: u32) -> Self {
        self.attempts = attempts;
        self.circuit_rejections = circuit_rejections;
        self
    }

    /// Marks the outputs as produced by the fallback.
    #[must_use]
    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sets the cache key.
    #[must_use]
    pub fn with_cache_key(mut self, key: Option<String>) -> Self {
        self.cache_key = key;
        self
    }

    /// Sets start time and derives the duration from it.
    #[must_use]
    pub fn with_timing(mut self, started_at: DateTime<Utc>, duration_ms: f64) -> Self {
        self.started_at = Some(started_at);
        self.duration_ms = duration_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factories_set_flags() {
        let cached = StepResult::cached("a", BTreeMap::new());
        assert!(cached.success && cached.cached && !cached.skipped);
        assert_eq!(cached.status, StepStatus::Completed);

        let resumed = StepResult::resumed("a", BTreeMap::new());
        assert!(resumed.cached && resumed.resumed && !resumed.skipped);

        let skipped = StepResult::skipped("b", "condition");
        assert!(skipped.success && skipped.skipped);
        assert!(skipped.outputs.is_empty());

        let failed = StepResult::failed("c", "boom", "StepExecutionError");
        assert!(!failed.success);
        assert_eq!(failed.status, StepStatus::Failed);
    }

    #[test]
    fn test_dependency_failed_result() {
        let result = StepResult::dependency_failed("report", "train");
        assert_eq!(result.status, StepStatus::DependencyFailed);
        assert_eq!(result.error_class.as_deref(), Some("DependencyFailedError"));
        assert!(result.error.unwrap().contains("'train'"));
    }

    #[test]
    fn test_serialize_omits_empty_fields() {
        let json = serde_json::to_value(StepResult::pending("x")).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["status"], "pending");
    }
}
