//! Content-addressed storage for step output values.
//!
//! Step results, cache entries and checkpoint records never hold raw values;
//! they hold [`ArtifactRef`] handles that resolve through an [`ArtifactStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::StoreError;
use crate::utils::{atomic_write, canonical_json, sha256_hex};

const REF_PREFIX: &str = "sha256:";

/// Handle to a stored output value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Computes the reference a value is stored under.
    #[must_use]
    pub fn for_value(value: &serde_json::Value) -> Self {
        Self(format!(
            "{REF_PREFIX}{}",
            sha256_hex(canonical_json(value).as_bytes())
        ))
    }

    /// Wraps an existing reference string.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the reference string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the hex digest without the algorithm prefix.
    #[must_use]
    pub fn digest(&self) -> &str {
        self.0.strip_prefix(REF_PREFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage backend for output values.
#[async_trait]
pub trait ArtifactStore: Send + Sync + fmt::Debug {
    /// Stores a value and returns its reference. Storing the same value twice
    /// is a no-op returning the same reference.
    async fn put(&self, value: &serde_json::Value) -> Result<ArtifactRef, StoreError>;

    /// Loads a value, or `None` if the reference is unknown.
    async fn get(&self, reference: &ArtifactRef) -> Result<Option<serde_json::Value>, StoreError>;

    /// Removes a value. Returns true if it existed.
    async fn remove(&self, reference: &ArtifactRef) -> Result<bool, StoreError>;

    /// Returns true if the reference resolves.
    async fn contains(&self, reference: &ArtifactRef) -> Result<bool, StoreError> {
        Ok(self.get(reference).await?.is_some())
    }
}

/// Stores every named output and returns the name-to-reference map.
pub async fn persist_outputs(
    store: &dyn ArtifactStore,
    outputs: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, ArtifactRef>, StoreError> {
    let mut refs = BTreeMap::new();
    for (name, value) in outputs {
        refs.insert(name.clone(), store.put(value).await?);
    }
    Ok(refs)
}

/// Resolves every reference. Returns `Ok(Err(reference))` naming the first
/// reference that no longer resolves.
pub async fn resolve_outputs(
    store: &dyn ArtifactStore,
    refs: &BTreeMap<String, ArtifactRef>,
) -> Result<Result<BTreeMap<String, serde_json::Value>, ArtifactRef>, StoreError> {
    let mut values = BTreeMap::new();
    for (name, reference) in refs {
        match store.get(reference).await? {
            Some(value) => {
                values.insert(name.clone(), value);
            }
            None => return Ok(Err(reference.clone())),
        }
    }
    Ok(Ok(values))
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    values: DashMap<ArtifactRef, serde_json::Value>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, value: &serde_json::Value) -> Result<ArtifactRef, StoreError> {
        let reference = ArtifactRef::for_value(value);
        self.values
            .entry(reference.clone())
            .or_insert_with(|| value.clone());
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.values.get(reference).map(|v| v.value().clone()))
    }

    async fn remove(&self, reference: &ArtifactRef) -> Result<bool, StoreError> {
        Ok(self.values.remove(reference).is_some())
    }
}

/// Artifact store laid out as `<root>/<digest[..2]>/<digest>.json`.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &ArtifactRef) -> PathBuf {
        let digest = crate::utils::sanitize_file_stem(reference.digest());
        let shard: String = digest.chars().take(2).collect();
        self.root.join(shard).join(format!("{digest}.json"))
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn put(&self, value: &serde_json::Value) -> Result<ArtifactRef, StoreError> {
        let reference = ArtifactRef::for_value(value);
        let path = self.path_for(&reference);
        if tokio::fs::try_exists(&path).await? {
            return Ok(reference);
        }
        let json = serde_json::to_vec(value)?;
        atomic_write(&path, &json).await?;
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.path_for(reference);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, reference: &ArtifactRef) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(reference)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ref_is_content_addressed() {
        let a = ArtifactRef::for_value(&json!({"x": 1, "y": 2}));
        let b = ArtifactRef::for_value(&json!({"y": 2, "x": 1}));
        let c = ArtifactRef::for_value(&json!({"x": 2}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.digest().len(), 64);
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryArtifactStore::new();
        let reference = store.put(&json!([1, 2, 3])).await.unwrap();
        let again = store.put(&json!([1, 2, 3])).await.unwrap();

        assert_eq!(reference, again);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&reference).await.unwrap(), Some(json!([1, 2, 3])));
        assert!(store.remove(&reference).await.unwrap());
        assert!(!store.contains(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());

        let reference = store.put(&json!({"rows": 10})).await.unwrap();
        assert_eq!(store.get(&reference).await.unwrap(), Some(json!({"rows": 10})));

        let reopened = FileArtifactStore::new(dir.path());
        assert!(reopened.contains(&reference).await.unwrap());

        assert!(reopened.remove(&reference).await.unwrap());
        assert!(!reopened.remove(&reference).await.unwrap());
        assert_eq!(reopened.get(&reference).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_and_resolve_outputs() {
        let store = InMemoryArtifactStore::new();
        let mut outputs = BTreeMap::new();
        outputs.insert("model".to_string(), json!("weights"));
        outputs.insert("score".to_string(), json!(0.93));

        let refs = persist_outputs(&store, &outputs).await.unwrap();
        let resolved = resolve_outputs(&store, &refs).await.unwrap().unwrap();
        assert_eq!(resolved, outputs);

        store.remove(&refs["score"]).await.unwrap();
        let missing = resolve_outputs(&store, &refs).await.unwrap();
        assert_eq!(missing, Err(refs["score"].clone()));
    }
}
