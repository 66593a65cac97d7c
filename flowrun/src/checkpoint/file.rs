//! File-backed checkpoint store: one JSON document per run.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{CheckpointRecord, CheckpointStore};
use crate::errors::StoreError;
use crate::utils::{atomic_write, sanitize_file_stem, sha256_hex};

/// Held while a run's document is read or written; drops the lock entry once
/// nobody else waits on it.
struct RunLock<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    run_id: String,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.run_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunCheckpoints {
    run_id: String,
    records: BTreeMap<String, CheckpointRecord>,
}

/// Checkpoint store writing `<root>/<run>.json` atomically.
///
/// Writes to one run are serialized by a per-run lock.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_locks: DashMap::new(),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        // Distinct ids may sanitize to the same stem; the digest suffix keeps them apart.
        let digest = sha256_hex(run_id.as_bytes());
        self.root
            .join(format!("{}-{}.json", sanitize_file_stem(run_id), &digest[..12]))
    }

    async fn lock_run(&self, run_id: &str) -> RunLock<'_> {
        let lock = self
            .run_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RunLock {
            guard: Some(lock.lock_owned().await),
            run_id: run_id.to_string(),
            locks: &self.run_locks,
        }
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<RunCheckpoints>, StoreError> {
        match tokio::fs::read(self.run_path(run_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn record_completion(&self, record: CheckpointRecord) -> Result<(), StoreError> {
        let _lock = self.lock_run(&record.run_id).await;

        let mut run = self.read_run(&record.run_id).await?.unwrap_or_else(|| RunCheckpoints {
            run_id: record.run_id.clone(),
            records: BTreeMap::new(),
        });
        let path = self.run_path(&record.run_id);
        tracing::debug!(run_id = %record.run_id, step = %record.step, "Writing checkpoint");
        run.records.insert(record.step.clone(), record);

        let json = serde_json::to_vec_pretty(&run)?;
        atomic_write(&path, &json).await?;
        Ok(())
    }

    async fn load_run_state(&self, run_id: &str) -> Result<BTreeMap<String, CheckpointRecord>, StoreError> {
        let _lock = self.lock_run(run_id).await;
        Ok(self.read_run(run_id).await?.map(|r| r.records).unwrap_or_default())
    }

    async fn clear_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let _lock = self.lock_run(run_id).await;
        match tokio::fs::remove_file(self.run_path(run_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                let bytes = tokio::fs::read(&path).await?;
                match serde_json::from_slice::<RunCheckpoints>(&bytes) {
                    Ok(run) => runs.push(run.run_id),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable checkpoint file");
                    }
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}
