//! Per-run, per-step completion records used to resume interrupted runs.
//!
//! A record is written only after the step's outputs are stored, so a crash
//! between execution and persistence never leaves a phantom completion.

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::artifacts::ArtifactRef;
use crate::core::StepStatus;
use crate::errors::StoreError;

/// Durable record that a step of a run completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// The run identifier.
    pub run_id: String,
    /// The step name.
    pub step: String,
    /// Completion status.
    pub status: StepStatus,
    /// Output references by output name.
    pub outputs: BTreeMap<String, ArtifactRef>,
    /// Whether the outputs were served from the cache.
    #[serde(default)]
    pub cached: bool,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Creates a completion record stamped with the current time.
    #[must_use]
    pub fn completed(
        run_id: impl Into<String>,
        step: impl Into<String>,
        outputs: BTreeMap<String, ArtifactRef>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step: step.into(),
            status: StepStatus::Completed,
            outputs,
            cached: false,
            recorded_at: Utc::now(),
        }
    }

    /// Sets the cached flag.
    #[must_use]
    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }
}

/// Checkpoint namespace: `(run_id, step) -> record`.
#[async_trait]
pub trait CheckpointStore: Send + Sync + fmt::Debug {
    /// Returns true if the step of the run has a completion record.
    async fn is_complete(&self, run_id: &str, step: &str) -> Result<bool, StoreError> {
        Ok(self.load_run_state(run_id).await?.contains_key(step))
    }

    /// Writes a completion record, replacing any previous record of the step.
    async fn record_completion(&self, record: CheckpointRecord) -> Result<(), StoreError>;

    /// Returns every record of a run by step name.
    async fn load_run_state(&self, run_id: &str) -> Result<BTreeMap<String, CheckpointRecord>, StoreError>;

    /// Removes every record of a run. Returns true if the run had records.
    async fn clear_run(&self, run_id: &str) -> Result<bool, StoreError>;

    /// Returns the ids of runs with records, sorted.
    async fn list_runs(&self) -> Result<Vec<String>, StoreError>;
}
