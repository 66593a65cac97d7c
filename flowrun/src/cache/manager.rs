//! Cache manager: resolves, serves and stores step outputs by cache key.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::key::{derive_key, CacheKey};
use super::store::{CacheEntry, CacheMetadata, CacheStore, InMemoryCacheStore};
use crate::artifacts::{persist_outputs, resolve_outputs, ArtifactStore, InMemoryArtifactStore};
use crate::errors::StoreError;
use crate::pipeline::{StepDescriptor, StepOutputs};

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries written.
    pub stores: u64,
    /// Entries removed by invalidation or clearing.
    pub invalidations: u64,
}

impl CacheStats {
    /// Hit rate over all lookups, 0.0 when nothing was looked up.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = self.hits as f64 / total as f64;
            rate
        }
    }
}

/// Outcome of [`CacheManager::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDecision {
    /// Whether usable outputs were found.
    pub hit: bool,
    /// The derived key; `None` when caching is disabled for the step.
    pub key: Option<CacheKey>,
    /// The entry that was hit.
    pub entry: Option<CacheEntry>,
    /// The resolved output values of a hit.
    pub outputs: Option<StepOutputs>,
}

impl CacheDecision {
    fn miss(key: Option<CacheKey>) -> Self {
        Self {
            hit: false,
            key,
            entry: None,
            outputs: None,
        }
    }
}

/// Writer lock of one cache key, returned by [`CacheManager::lock_key`].
///
/// Dropping it releases the key; the lock entry is discarded once no other
/// caller is waiting on it.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: CacheKey,
    locks: &'a DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Serves and stores step outputs keyed by cache key.
///
/// Only one writer per key is allowed at a time: callers take
/// [`lock_key`](Self::lock_key) and look the key up again before computing.
#[derive(Debug)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    artifacts: Arc<dyn ArtifactStore>,
    default_ttl: Option<Duration>,
    key_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
        )
    }
}

impl CacheManager {
    /// Creates a manager over the given stores.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            artifacts,
            default_ttl: None,
            key_locks: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Sets the TTL applied to entries of steps that declare none.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Returns the underlying cache store.
    #[must_use]
    pub fn cache_store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Derives the key of an invocation of `step`.
    #[must_use]
    pub fn key_for(
        &self,
        step: &StepDescriptor,
        inputs: &[(&str, &Value)],
        params: &BTreeMap<String, Value>,
    ) -> Option<CacheKey> {
        derive_key(
            step.name(),
            step.cache_strategy(),
            &step.fingerprint(),
            inputs,
            &step.select_params(params),
        )
    }

    /// Derives the key of an invocation and looks it up.
    pub async fn resolve(
        &self,
        step: &StepDescriptor,
        inputs: &[(&str, &Value)],
        params: &BTreeMap<String, Value>,
    ) -> Result<CacheDecision, StoreError> {
        let Some(key) = self.key_for(step, inputs, params) else {
            return Ok(CacheDecision::miss(None));
        };
        self.lookup(&key).await
    }

    /// Looks a key up. Expired entries and entries whose artifacts no longer
    /// resolve are removed and reported as misses.
    pub async fn lookup(&self, key: &CacheKey) -> Result<CacheDecision, StoreError> {
        let Some(entry) = self.store.get(key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(CacheDecision::miss(Some(key.clone())));
        };

        if entry.is_expired() {
            debug!(cache_key = %key, step = %entry.metadata.step, "Cache entry expired");
            self.store.remove(key).await?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(CacheDecision::miss(Some(key.clone())));
        }

        match resolve_outputs(self.artifacts.as_ref(), &entry.outputs).await? {
            Ok(outputs) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, step = %entry.metadata.step, "Cache hit");
                Ok(CacheDecision {
                    hit: true,
                    key: Some(key.clone()),
                    entry: Some(entry),
                    outputs: Some(outputs),
                })
            }
            Err(missing) => {
                warn!(
                    cache_key = %key,
                    step = %entry.metadata.step,
                    artifact = %missing,
                    "Cache entry references a missing artifact, dropping it"
                );
                self.store.remove(key).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheDecision::miss(Some(key.clone())))
            }
        }
    }

    /// Persists the outputs to the artifact store, then writes the entry.
    pub async fn store(
        &self,
        step: &StepDescriptor,
        key: &CacheKey,
        outputs: &StepOutputs,
    ) -> Result<CacheEntry, StoreError> {
        let refs = persist_outputs(self.artifacts.as_ref(), outputs).await?;
        let metadata = CacheMetadata::new(step.name(), step.fingerprint(), step.cache_strategy());
        let entry = CacheEntry::new(key.clone(), refs, metadata)
            .with_ttl(step.cache_ttl().or(self.default_ttl));
        self.store.put(entry.clone()).await?;
        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key = %key, step = %step.name(), "Cache entry stored");
        Ok(entry)
    }

    /// Takes the writer lock of a key.
    pub async fn lock_key(&self, key: &CacheKey) -> KeyGuard<'_> {
        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            guard: Some(lock.lock_owned().await),
            key: key.clone(),
            locks: &self.key_locks,
        }
    }

    /// Removes every entry of a step.
    pub async fn invalidate(&self, step: &str) -> Result<usize, StoreError> {
        let removed = self.store.remove_step(step).await?;
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(step = %step, removed, "Cache invalidated for step");
        Ok(removed)
    }

    /// Alias of [`invalidate`](Self::invalidate).
    pub async fn clear_step(&self, step: &str) -> Result<usize, StoreError> {
        self.invalidate(step).await
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.store.clear().await?;
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
