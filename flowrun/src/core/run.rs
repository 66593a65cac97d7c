//! The run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{RunStatus, StepResult, StepStatus};

/// Failure report of a run that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The first step that failed, if any step failed.
    pub first_failed_step: Option<String>,
    /// The error of that step.
    pub error: Option<String>,
    /// Steps that were not executed because an upstream step failed.
    pub dependency_failed: Vec<String>,
    /// Steps never dispatched because the run was cancelled.
    pub not_started: Vec<String>,
}

/// One execution attempt of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// The run identifier.
    pub run_id: String,
    /// The pipeline name.
    pub pipeline: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Overall status.
    pub status: RunStatus,
    /// Results keyed by step name.
    pub steps: BTreeMap<String, StepResult>,
    /// Whether the run was cancelled.
    #[serde(default)]
    pub cancelled: bool,
    /// Failure report, set when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl Run {
    /// Creates a running run with a pending result for every step.
    #[must_use]
    pub fn new<'a>(
        run_id: impl Into<String>,
        pipeline: impl Into<String>,
        steps: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            steps: steps
                .into_iter()
                .map(|name| (name.to_string(), StepResult::pending(name)))
                .collect(),
            cancelled: false,
            failure: None,
        }
    }

    /// Returns the result of a step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.get(name)
    }

    /// Replaces the result of a step.
    pub fn record(&mut self, result: StepResult) {
        self.steps.insert(result.step.clone(), result);
    }

    /// Names of steps with the given status.
    #[must_use]
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<String> {
        self.steps
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.step.clone())
            .collect()
    }

    /// Names of steps served from cache or checkpoint.
    #[must_use]
    pub fn cached_steps(&self) -> Vec<String> {
        self.steps
            .values()
            .filter(|r| r.cached)
            .map(|r| r.step.clone())
            .collect()
    }

    /// Names of steps whose logic was actually invoked during this run.
    #[must_use]
    pub fn executed_steps(&self) -> Vec<String> {
        self.steps
            .values()
            .filter(|r| r.attempts > 0)
            .map(|r| r.step.clone())
            .collect()
    }

    /// Returns true if the run completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Moves the run to its terminal status.
    ///
    /// `first_failure` is the first step that failed in time order.
    pub fn finish(&mut self, first_failure: Option<(String, String)>) {
        let dependency_failed = self.steps_with_status(StepStatus::DependencyFailed);
        let not_started = self.steps_with_status(StepStatus::NotStarted);
        let any_failed = self.steps.values().any(|r| r.status.is_failure());

        self.finished_at = Some(Utc::now());
        if any_failed || self.cancelled || !not_started.is_empty() {
            self.status = RunStatus::Failed;
            let (first_failed_step, error) = match first_failure {
                Some((step, error)) => (Some(step), Some(error)),
                None => (None, None),
            };
            self.failure = Some(RunFailure {
                first_failed_step,
                error,
                dependency_failed,
                not_started,
            });
        } else {
            self.status = RunStatus::Completed;
            self.failure = None;
        }
    }
}
