//! Executor backend selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How execution units are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorBackend {
    /// One unit at a time on the driving task.
    #[default]
    Sequential,
    /// Units run as Tokio tasks.
    ThreadPool,
    /// Units run on the blocking thread pool, for CPU-bound steps.
    ProcessPool,
}

impl ExecutorBackend {
    /// Returns true if units may run concurrently.
    #[must_use]
    pub fn is_concurrent(self) -> bool {
        !matches!(self, Self::Sequential)
    }
}

impl fmt::Display for ExecutorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::ThreadPool => write!(f, "thread_pool"),
            Self::ProcessPool => write!(f, "process_pool"),
        }
    }
}

impl FromStr for ExecutorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(Self::Sequential),
            "thread_pool" | "threads" => Ok(Self::ThreadPool),
            "process_pool" | "processes" => Ok(Self::ProcessPool),
            other => Err(format!("unknown executor backend '{other}'")),
        }
    }
}

/// Backend plus worker bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Dispatch backend.
    #[serde(default)]
    pub backend: ExecutorBackend,
    /// Maximum units in flight. Ignored by the sequential backend.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            max_workers: default_max_workers(),
        }
    }
}

impl ExecutorConfig {
    /// Sequential execution.
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            backend: ExecutorBackend::Sequential,
            max_workers: 1,
        }
    }

    /// Task-based concurrent execution.
    #[must_use]
    pub fn thread_pool(max_workers: usize) -> Self {
        Self {
            backend: ExecutorBackend::ThreadPool,
            max_workers: max_workers.max(1),
        }
    }

    /// Blocking-pool execution.
    #[must_use]
    pub fn process_pool(max_workers: usize) -> Self {
        Self {
            backend: ExecutorBackend::ProcessPool,
            max_workers: max_workers.max(1),
        }
    }

    /// Effective number of concurrent units.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        if self.backend.is_concurrent() {
            self.max_workers.max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("thread-pool".parse::<ExecutorBackend>().unwrap(), ExecutorBackend::ThreadPool);
        assert_eq!("PROCESS_POOL".parse::<ExecutorBackend>().unwrap(), ExecutorBackend::ProcessPool);
        assert!("gpu".parse::<ExecutorBackend>().is_err());
        assert_eq!(ExecutorBackend::ThreadPool.to_string(), "thread_pool");
    }

    #[test]
    fn test_parallelism() {
        assert_eq!(ExecutorConfig::sequential().parallelism(), 1);
        assert_eq!(ExecutorConfig::thread_pool(0).parallelism(), 1);
        assert_eq!(ExecutorConfig::process_pool(3).parallelism(), 3);
        let cfg = ExecutorConfig { backend: ExecutorBackend::Sequential, max_workers: 8 };
        assert_eq!(cfg.parallelism(), 1);
    }

    #[test]
    fn test_deserialize_defaults() {
        let cfg: ExecutorConfig = serde_json::from_str(r#"{"backend": "thread_pool"}"#).unwrap();
        assert_eq!(cfg.backend, ExecutorBackend::ThreadPool);
        assert!(cfg.max_workers >= 1);
    }
}
