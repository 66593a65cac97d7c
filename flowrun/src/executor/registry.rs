//! Registry of runs known to an engine.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::core::{Run, StepResult};

/// Live handle on a run; the scheduler writes through it while the run executes.
pub(crate) type SharedRun = Arc<RwLock<Run>>;

/// Runs published by the engine, in progress or finished.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<String, SharedRun>,
}

impl RunRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a run and returns its live handle. Replaces an earlier run
    /// with the same id.
    pub(crate) fn publish(&self, run: Run) -> SharedRun {
        let shared = Arc::new(RwLock::new(run));
        self.runs.insert(shared.read().run_id.clone(), shared.clone());
        shared
    }

    /// Returns a snapshot of a run.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.runs.get(run_id).map(|run| run.read().clone())
    }

    /// Returns a snapshot of one step result.
    #[must_use]
    pub fn step_result(&self, run_id: &str, step: &str) -> Option<StepResult> {
        self.runs
            .get(run_id)
            .and_then(|run| run.read().step(step).cloned())
    }

    /// Ids of all published runs, sorted.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forgets a run.
    pub fn remove(&self, run_id: &str) -> Option<Run> {
        self.runs.remove(run_id).map(|(_, run)| run.read().clone())
    }

    /// Number of published runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no run was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStatus, StepStatus};

    #[test]
    fn test_publish_is_live() {
        let registry = RunRegistry::new();
        let shared = registry.publish(Run::new("r1", "p", ["a"]));
        assert_eq!(registry.get("r1").unwrap().status, RunStatus::Running);

        shared.write().record(StepResult::skipped("a", "test"));
        assert_eq!(
            registry.step_result("r1", "a").unwrap().status,
            StepStatus::Skipped
        );
        assert!(registry.step_result("r1", "b").is_none());
        assert!(registry.get("r2").is_none());
    }

    #[test]
    fn test_remove() {
        let registry = RunRegistry::new();
        registry.publish(Run::new("b", "p", ["a"]));
        registry.publish(Run::new("a", "p", ["a"]));
        assert_eq!(registry.run_ids(), vec!["a", "b"]);

        assert!(registry.remove("a").is_some());
        assert_eq!(registry.len(), 1);
    }
}
