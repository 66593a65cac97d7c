//! The engine: stores, resilience state and the run registry behind one handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::config::ExecutorConfig;
use super::registry::RunRegistry;
use super::scheduler::{self, RunRequest, Services};
use crate::artifacts::{ArtifactStore, FileArtifactStore, InMemoryArtifactStore};
use crate::cache::{CacheManager, CacheStore, FileCacheStore, InMemoryCacheStore};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::config::EngineConfig;
use crate::core::{Run, StepResult};
use crate::errors::EngineError;
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::PipelineGraph;
use crate::resilience::{CircuitBreakerRegistry, ResilienceWrapper};

/// Executes pipeline graphs.
///
/// Circuit-breaker state, the cache and the run registry live as long as the
/// engine; create one engine per process and share it.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::in_memory();
/// let run = engine.run(&graph, RunRequest::new().with_input("raw", json!([1, 2]))).await?;
/// assert!(run.is_success());
/// ```
pub struct Engine {
    services: Services,
    breakers: Arc<CircuitBreakerRegistry>,
    executor: ExecutorConfig,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("executor", &self.executor)
            .field("runs", &self.services.runs.len())
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Engine {
    /// Creates an engine with in-memory stores and no event sink.
    #[must_use]
    pub fn in_memory() -> Self {
        EngineBuilder::new().build()
    }

    /// Returns a builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Creates an engine from configuration. Configured directories select
    /// the file-backed stores.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut builder = EngineBuilder::new()
            .with_executor(config.executor)
            .with_default_cache_ttl(config.default_cache_ttl());

        if let Some(dir) = &config.artifact_dir {
            builder = builder.with_artifact_store(Arc::new(FileArtifactStore::new(dir)));
        }
        if let Some(dir) = &config.cache_dir {
            builder = builder.with_cache_store(Arc::new(FileCacheStore::open(dir).await?));
        }
        if let Some(dir) = &config.checkpoint_dir {
            builder = builder.with_checkpoint_store(Arc::new(FileCheckpointStore::new(dir)));
        }
        Ok(builder.build())
    }

    /// Runs `graph`. Resumes when `request.run_id` has checkpoints.
    ///
    /// Step failures are reported in the returned [`Run`]; errors are
    /// reserved for run-level problems.
    pub async fn run(&self, graph: &PipelineGraph, request: RunRequest) -> Result<Run, EngineError> {
        scheduler::execute(&self.services, graph, request, self.executor).await
    }

    /// Synchronous [`run`](Self::run) on a fresh Tokio runtime.
    ///
    /// Must not be called from within an async runtime.
    pub fn run_blocking(&self, graph: &PipelineGraph, request: RunRequest) -> Result<Run, EngineError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(EngineError::Runtime(
                "run_blocking called from within an async runtime; use run".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;
        runtime.block_on(self.run(graph, request))
    }

    /// Returns a snapshot of a run, in progress or finished.
    #[must_use]
    pub fn get_run(&self, run_id: &str) -> Option<Run> {
        self.services.runs.get(run_id)
    }

    /// Returns a snapshot of one step's result.
    #[must_use]
    pub fn get_step_result(&self, run_id: &str, step: &str) -> Option<StepResult> {
        self.services.runs.step_result(run_id, step)
    }

    /// Returns the run registry.
    #[must_use]
    pub fn runs(&self) -> &RunRegistry {
        &self.services.runs
    }

    /// Returns the cache manager.
    #[must_use]
    pub fn cache(&self) -> &CacheManager {
        &self.services.cache
    }

    /// Returns the checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.services.checkpoints.as_ref()
    }

    /// Returns the artifact store that resolves output references.
    #[must_use]
    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.services.artifacts.as_ref()
    }

    /// Returns the circuit breakers.
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.services.events
    }

    /// Returns the default executor.
    #[must_use]
    pub fn executor(&self) -> ExecutorConfig {
        self.executor
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    cache_store: Option<Arc<dyn CacheStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    events: Option<Arc<dyn EventSink>>,
    executor: ExecutorConfig,
    default_cache_ttl: Option<Duration>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("executor", &self.executor)
            .field("default_cache_ttl", &self.default_cache_ttl)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Creates a builder with in-memory defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache index store.
    #[must_use]
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Sets the artifact store.
    #[must_use]
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Sets the default executor.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the TTL of cache entries whose step declares none.
    #[must_use]
    pub fn with_default_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_cache_ttl = ttl;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Engine {
        let artifacts: Arc<dyn ArtifactStore> = self
            .artifacts
            .unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new()));
        let cache_store: Arc<dyn CacheStore> = self
            .cache_store
            .unwrap_or_else(|| Arc::new(InMemoryCacheStore::new()));
        let checkpoints: Arc<dyn CheckpointStore> = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let events: Arc<dyn EventSink> = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let breakers = Arc::new(CircuitBreakerRegistry::new());

        let cache = CacheManager::new(cache_store, artifacts.clone()).with_default_ttl(self.default_cache_ttl);

        Engine {
            services: Services {
                cache: Arc::new(cache),
                checkpoints,
                artifacts,
                wrapper: ResilienceWrapper::new(breakers.clone(), events.clone()),
                events,
                runs: Arc::new(RunRegistry::new()),
            },
            breakers,
            executor: self.executor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorBackend;

    #[test]
    fn test_builder_defaults() {
        let engine = Engine::builder()
            .with_executor(ExecutorConfig::thread_pool(2))
            .build();
        assert_eq!(engine.executor().backend, ExecutorBackend::ThreadPool);
        assert!(engine.runs().is_empty());
        assert_eq!(engine.cache().stats().hits, 0);
    }

    #[tokio::test]
    async fn test_from_config_uses_file_stores() {
        let temp = tempfile::tempdir().unwrap();
        let config = EngineConfig::new().with_state_dir(temp.path());
        let engine = Engine::from_config(&config).await.unwrap();

        assert!(engine.checkpoints().list_runs().await.unwrap().is_empty());
        assert!(engine.get_run("nope").is_none());
    }

    #[tokio::test]
    async fn test_run_blocking_rejects_nested_runtime() {
        let engine = Engine::in_memory();
        let graph = crate::pipeline::PipelineBuilder::new("p")
            .step(crate::pipeline::StepDescriptor::new(
                "a",
                crate::testing::ConstStep::single("x", serde_json::json!(1)),
            ).with_outputs(["x"]))
            .build()
            .unwrap();
        let err = engine.run_blocking(&graph, RunRequest::new()).unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));
    }
}
