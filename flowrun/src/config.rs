//! Engine configuration.
//!
//! Configuration can come from:
//! - A JSON document ([`EngineConfig::from_json_str`], [`EngineConfig::from_file`])
//! - Environment variables (`FLOWRUN_*`)
//! - Builder-style setters
//!
//! Absent store directories select the in-memory backends.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::EngineError;
use crate::executor::{ExecutorBackend, ExecutorConfig};

/// Cache directory override.
pub const ENV_CACHE_DIR: &str = "FLOWRUN_CACHE_DIR";
/// Checkpoint directory override.
pub const ENV_CHECKPOINT_DIR: &str = "FLOWRUN_CHECKPOINT_DIR";
/// Artifact directory override.
pub const ENV_ARTIFACT_DIR: &str = "FLOWRUN_ARTIFACT_DIR";
/// Executor backend override.
pub const ENV_BACKEND: &str = "FLOWRUN_BACKEND";
/// Worker count override.
pub const ENV_MAX_WORKERS: &str = "FLOWRUN_MAX_WORKERS";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory of the file cache index.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Directory of per-run checkpoint files.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Directory of the content-addressed artifact store.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,

    /// Executor used when a run request does not pick one.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// TTL applied to cache entries of steps without their own.
    #[serde(default)]
    pub default_cache_ttl_ms: Option<u64>,
}

impl EngineConfig {
    /// Creates an all-in-memory configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Reads a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Applies `FLOWRUN_*` environment variables.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR) {
            self.checkpoint_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(ENV_ARTIFACT_DIR) {
            self.artifact_dir = Some(PathBuf::from(dir));
        }
        if let Some(backend) = lookup(ENV_BACKEND) {
            match backend.parse::<ExecutorBackend>() {
                Ok(parsed) => self.executor.backend = parsed,
                Err(err) => tracing::warn!(variable = ENV_BACKEND, error = %err, "Ignoring override"),
            }
        }
        if let Some(workers) = lookup(ENV_MAX_WORKERS) {
            match workers.parse::<usize>() {
                Ok(parsed) if parsed > 0 => self.executor.max_workers = parsed,
                _ => tracing::warn!(variable = ENV_MAX_WORKERS, value = %workers, "Ignoring override"),
            }
        }
        self
    }

    /// Sets the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Sets the checkpoint directory.
    #[must_use]
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Sets the artifact directory.
    #[must_use]
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    /// Places cache, checkpoints and artifacts under one root.
    #[must_use]
    pub fn with_state_dir(self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.with_cache_dir(root.join("cache"))
            .with_checkpoint_dir(root.join("checkpoints"))
            .with_artifact_dir(root.join("artifacts"))
    }

    /// Sets the default executor.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the default cache TTL.
    #[must_use]
    pub fn with_default_cache_ttl(mut self, ttl: Duration) -> Self {
        self.default_cache_ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Returns the default cache TTL.
    #[must_use]
    pub fn default_cache_ttl(&self) -> Option<Duration> {
        self.default_cache_ttl_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_from_json_applies_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"cache_dir": "/tmp/c", "executor": {"backend": "process_pool", "max_workers": 2}}"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/c")));
        assert_eq!(config.checkpoint_dir, None);
        assert_eq!(config.executor, ExecutorConfig::process_pool(2));
        assert_eq!(config.default_cache_ttl(), None);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowrun.json");
        std::fs::write(&path, r#"{"default_cache_ttl_ms": 1500}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.default_cache_ttl(), Some(Duration::from_millis(1500)));
        assert!(EngineConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_CHECKPOINT_DIR, "/var/flowrun/ckpt"),
            (ENV_BACKEND, "thread_pool"),
            (ENV_MAX_WORKERS, "0"),
        ]);
        let config = EngineConfig::new()
            .with_executor(ExecutorConfig::sequential())
            .with_overrides_from(|k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/var/flowrun/ckpt")));
        assert_eq!(config.executor.backend, ExecutorBackend::ThreadPool);
        // Zero workers is rejected.
        assert_eq!(config.executor.max_workers, 1);
    }

    #[test]
    fn test_state_dir_layout() {
        let config = EngineConfig::new().with_state_dir("/data");
        assert_eq!(config.artifact_dir, Some(PathBuf::from("/data/artifacts")));
        assert_eq!(config.cache_dir, Some(PathBuf::from("/data/cache")));
    }
}
