//! Cache entries and their storage backends.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use super::key::{CacheKey, CacheStrategy};
use crate::artifacts::ArtifactRef;
use crate::errors::StoreError;
use crate::utils::atomic_write;

const INDEX_FILE: &str = "index.json";

/// Metadata stored alongside a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// The step the entry belongs to.
    pub step: String,
    /// Fingerprint in effect when the entry was written.
    pub fingerprint: String,
    /// Strategy used to derive the key.
    pub strategy: CacheStrategy,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl CacheMetadata {
    /// Creates metadata stamped with the current time.
    #[must_use]
    pub fn new(step: impl Into<String>, fingerprint: impl Into<String>, strategy: CacheStrategy) -> Self {
        Self {
            step: step.into(),
            fingerprint: fingerprint.into(),
            strategy,
            created_at: Utc::now(),
        }
    }
}

/// A cached step result: output references plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key.
    pub key: CacheKey,
    /// Output references by output name.
    pub outputs: BTreeMap<String, ArtifactRef>,
    /// Entry metadata.
    pub metadata: CacheMetadata,
    /// Expiry time, if the entry has a TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Creates an entry without expiry.
    #[must_use]
    pub fn new(key: CacheKey, outputs: BTreeMap<String, ArtifactRef>, metadata: CacheMetadata) -> Self {
        Self {
            key,
            outputs,
            metadata,
            expires_at: None,
        }
    }

    /// Sets the TTL relative to the creation time.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = ttl
            .and_then(|ttl| ChronoDuration::from_std(ttl).ok())
            .map(|ttl| self.metadata.created_at + ttl);
        self
    }

    /// Returns true if the entry has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Returns true if the entry has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Key-value namespace of cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Loads an entry.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Writes an entry, superseding any entry with the same key.
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// Removes an entry. Returns true if it existed.
    async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError>;

    /// Removes every entry of a step. Returns the number removed.
    async fn remove_step(&self, step: &str) -> Result<usize, StoreError>;

    /// Removes every entry. Returns the number removed.
    async fn clear(&self) -> Result<usize, StoreError>;

    /// Returns all entries.
    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError>;

    /// Returns the number of entries.
    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries().await?.len())
    }
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl InMemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn remove_step(&self, step: &str) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.metadata.step != step);
        Ok(before - self.entries.len())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let count = self.entries.len();
        self.entries.clear();
        Ok(count)
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

/// Cache store persisted as a single `index.json` in a directory.
///
/// Output values are not stored here; entries only reference artifacts.
#[derive(Debug)]
pub struct FileCacheStore {
    root: PathBuf,
    index: Mutex<BTreeMap<CacheKey, CacheEntry>>,
}

impl FileCacheStore {
    /// Opens (or creates) a store rooted at `root`, loading the existing index.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let index = match tokio::fs::read(root.join(INDEX_FILE)).await {
            Ok(bytes) => {
                let entries: Vec<CacheEntry> = serde_json::from_slice(&bytes)?;
                entries.into_iter().map(|e| (e.key.clone(), e)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(root = %root.display(), entries = index.len(), "Opened file cache store");
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn flush(&self, index: &BTreeMap<CacheKey, CacheEntry>) -> Result<(), StoreError> {
        let entries: Vec<&CacheEntry> = index.values().collect();
        let json = serde_json::to_vec_pretty(&entries)?;
        atomic_write(&self.root.join(INDEX_FILE), &json).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.index.lock().await.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        index.insert(entry.key.clone(), entry);
        self.flush(&index).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut index = self.index.lock().await;
        let removed = index.remove(key).is_some();
        if removed {
            self.flush(&index).await?;
        }
        Ok(removed)
    }

    async fn remove_step(&self, step: &str) -> Result<usize, StoreError> {
        let mut index = self.index.lock().await;
        let before = index.len();
        index.retain(|_, entry| entry.metadata.step != step);
        let removed = before - index.len();
        if removed > 0 {
            self.flush(&index).await?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut index = self.index.lock().await;
        let count = index.len();
        index.clear();
        self.flush(&index).await?;
        Ok(count)
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.index.lock().await.values().cloned().collect())
    }
}
