//! In-memory checkpoint store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

use super::{CheckpointRecord, CheckpointStore};
use crate::errors::StoreError;

/// Checkpoint store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<String, BTreeMap<String, CheckpointRecord>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn is_complete(&self, run_id: &str, step: &str) -> Result<bool, StoreError> {
        Ok(self
            .runs
            .get(run_id)
            .is_some_and(|records| records.contains_key(step)))
    }

    async fn record_completion(&self, record: CheckpointRecord) -> Result<(), StoreError> {
        self.runs
            .entry(record.run_id.clone())
            .or_default()
            .insert(record.step.clone(), record);
        Ok(())
    }

    async fn load_run_state(&self, run_id: &str) -> Result<BTreeMap<String, CheckpointRecord>, StoreError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn clear_run(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.runs.remove(run_id).is_some())
    }

    async fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let mut runs: Vec<String> = self.runs.iter().map(|r| r.key().clone()).collect();
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_load() {
        let store = InMemoryCheckpointStore::new();
        store
            .record_completion(CheckpointRecord::completed("r1", "a", BTreeMap::new()))
            .await
            .unwrap();
        store
            .record_completion(CheckpointRecord::completed("r1", "b", BTreeMap::new()).with_cached(true))
            .await
            .unwrap();

        assert!(store.is_complete("r1", "a").await.unwrap());
        assert!(!store.is_complete("r1", "c").await.unwrap());
        assert!(!store.is_complete("r2", "a").await.unwrap());

        let state = store.load_run_state("r1").await.unwrap();
        assert_eq!(state.len(), 2);
        assert!(state["b"].cached);
        assert_eq!(store.list_runs().await.unwrap(), vec!["r1".to_string()]);

        assert!(store.clear_run("r1").await.unwrap());
        assert!(store.load_run_state("r1").await.unwrap().is_empty());
    }
}
