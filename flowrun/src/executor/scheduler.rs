//! Run scheduling.
//!
//! A run walks the execution plan unit by unit. A unit becomes ready once all
//! of its predecessor units are terminal; ready units are dispatched to the
//! configured backend with at most `max_workers` in flight. Member steps of a
//! unit run in order on the same worker.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

use super::config::{ExecutorBackend, ExecutorConfig};
use super::registry::{RunRegistry, SharedRun};
use crate::artifacts::{persist_outputs, resolve_outputs, ArtifactRef, ArtifactStore};
use crate::cache::{CacheKey, CacheManager};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::conditions::{ConditionEvaluator, Decision, RunSnapshot};
use crate::core::{Run, StepResult, StepStatus};
use crate::errors::EngineError;
use crate::events::{self, EventSink};
use crate::observability::{run_span, step_span};
use crate::pipeline::{plan, ExecutionPlan, PipelineGraph, StepContext, StepOutputs};
use crate::resilience::ResilienceWrapper;
use crate::utils::generate_run_id;

/// Parameters of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Run id. A fresh UUID v7 when absent; an id with checkpoints resumes.
    pub run_id: Option<String>,
    /// Values of the pipeline's external inputs.
    pub external_inputs: BTreeMap<String, Value>,
    /// Run parameters; steps see the ones they declare.
    pub params: BTreeMap<String, Value>,
    /// Executor override for this run.
    pub executor: Option<ExecutorConfig>,
    /// Token that stops dispatching when cancelled.
    pub cancellation: Option<Arc<CancellationToken>>,
}

impl RunRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Supplies one external input.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.external_inputs.insert(name.into(), value);
        self
    }

    /// Supplies several external inputs.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        self.external_inputs
            .extend(inputs.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Sets one run parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Overrides the executor.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Collaborators shared by every run of an engine.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) wrapper: ResilienceWrapper,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) runs: Arc<RunRegistry>,
}

struct RestoredStep {
    step: String,
    refs: BTreeMap<String, ArtifactRef>,
    values: StepOutputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepFlow {
    Continue,
    Halt,
}

/// State of one run shared between its workers.
struct Scheduler {
    graph: PipelineGraph,
    plan: ExecutionPlan,
    run_id: String,
    params: BTreeMap<String, Value>,
    executor: ExecutorConfig,
    cancellation: Option<Arc<CancellationToken>>,
    services: Services,
    evaluator: ConditionEvaluator,
    run: SharedRun,
    values: RwLock<BTreeMap<String, Value>>,
    skipped: RwLock<BTreeSet<String>>,
    first_failure: Mutex<Option<(String, String)>>,
}

/// Executes one run of `graph`.
pub(crate) async fn execute(
    services: &Services,
    graph: &PipelineGraph,
    request: RunRequest,
    default_executor: ExecutorConfig,
) -> Result<Run, EngineError> {
    let RunRequest {
        run_id,
        external_inputs,
        params,
        executor,
        cancellation,
    } = request;
    let run_id = run_id.unwrap_or_else(generate_run_id);

    if let Some(missing) = graph
        .external_inputs()
        .iter()
        .find(|name| !external_inputs.contains_key(*name))
    {
        return Err(EngineError::MissingExternalInput(missing.clone()));
    }

    let restored = restore_checkpoints(services, graph, &run_id).await?;
    let run = services
        .runs
        .publish(Run::new(run_id.clone(), graph.name(), graph.step_names()));

    let scheduler = Arc::new(Scheduler {
        graph: graph.clone(),
        plan: plan(graph),
        run_id: run_id.clone(),
        params,
        executor: executor.unwrap_or(default_executor),
        cancellation,
        services: services.clone(),
        evaluator: ConditionEvaluator::new(graph.clone()),
        run,
        values: RwLock::new(BTreeMap::new()),
        skipped: RwLock::new(BTreeSet::new()),
        first_failure: Mutex::new(None),
    });
    let span = run_span(graph.name(), &run_id);
    scheduler.drive(&external_inputs, restored).instrument(span).await
}

/// Loads the checkpoints of `run_id` and resolves their outputs.
async fn restore_checkpoints(
    services: &Services,
    graph: &PipelineGraph,
    run_id: &str,
) -> Result<Vec<RestoredStep>, EngineError> {
    let records = services.checkpoints.load_run_state(run_id).await?;
    let mut restored = Vec::with_capacity(records.len());

    for (step, record) in records {
        if graph.index_of(&step).is_none() {
            warn!(run_id = %run_id, step = %step, "Ignoring checkpoint of a step not in the pipeline");
            continue;
        }
        if record.status != StepStatus::Completed {
            continue;
        }
        match resolve_outputs(services.artifacts.as_ref(), &record.outputs).await? {
            Ok(values) => restored.push(RestoredStep {
                step,
                refs: record.outputs,
                values,
            }),
            Err(missing) => {
                return Err(EngineError::CheckpointInconsistency {
                    run_id: run_id.to_string(),
                    step,
                    reference: missing.to_string(),
                });
            }
        }
    }

    if !restored.is_empty() {
        info!(run_id = %run_id, steps = restored.len(), "Resuming run from checkpoints");
    }
    Ok(restored)
}

/// Checks that every declared output is present and drops undeclared ones.
impl Scheduler {
    fn emit(&self, event_type: &str, data: Value) {
        self.services.events.try_emit(event_type, Some(data));
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    fn status_of(&self, step: &str) -> Option<StepStatus> {
        self.run.read().step(step).map(|r| r.status)
    }

    fn record(&self, result: StepResult) {
        self.run.write().record(result);
    }

    fn publish_values(&self, values: StepOutputs) {
        self.values.write().extend(values);
    }

    fn snapshot(&self) -> RunSnapshot {
        let mut snapshot = RunSnapshot::new(self.values.read().clone(), self.params.clone());
        snapshot.skipped = self.skipped.read().clone();
        snapshot
    }

    fn seed(&self, external_inputs: &BTreeMap<String, Value>, restored: Vec<RestoredStep>) {
        {
            let mut values = self.values.write();
            for name in self.graph.external_inputs() {
                if let Some(value) = external_inputs.get(name) {
                    values.insert(name.clone(), value.clone());
                }
            }
        }

        for restored in restored {
            self.publish_values(restored.values);
            self.emit(
                events::STEP_CACHED,
                json!({"run_id": self.run_id, "step": restored.step, "resumed": true}),
            );
            self.record(StepResult::resumed(restored.step, restored.refs));
        }
    }

    async fn drive(
        self: Arc<Self>,
        external_inputs: &BTreeMap<String, Value>,
        restored: Vec<RestoredStep>,
    ) -> Result<Run, EngineError> {
        let units = self.plan.units();
        info!(
            run_id = %self.run_id,
            pipeline = %self.graph.name(),
            steps = self.graph.len(),
            units = units.len(),
            backend = %self.executor.backend,
            "Run started"
        );
        self.emit(
            events::RUN_STARTED,
            json!({
                "run_id": self.run_id,
                "pipeline": self.graph.name(),
                "steps": self.graph.len(),
                "backend": self.executor.backend.to_string(),
            }),
        );
        self.seed(external_inputs, restored);

        let mut remaining: Vec<usize> = units.iter().map(|u| u.predecessors.len()).collect();
        let mut ready: VecDeque<usize> = (0..units.len()).filter(|&u| remaining[u] == 0).collect();
        let mut in_flight = FuturesUnordered::new();
        let limit = self.executor.parallelism();
        let mut outcome = Ok(());

        loop {
            while in_flight.len() < limit && outcome.is_ok() {
                let Some(unit) = ready.pop_front() else { break };
                in_flight.push(self.clone().dispatch(unit));
            }

            let Some(result) = in_flight.next().await else { break };
            match result {
                Ok(unit) => {
                    for &successor in &units[unit].successors {
                        remaining[successor] -= 1;
                        if remaining[successor] == 0 {
                            ready.push_back(successor);
                        }
                    }
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, error = %err, "Run aborted");
                    if outcome.is_ok() {
                        outcome = Err(err);
                    }
                }
            }
        }

        self.finish(outcome)
    }

    /// Starts a unit on the configured backend.
    fn dispatch(self: Arc<Self>, unit: usize) -> BoxFuture<'static, Result<usize, EngineError>> {
        match self.executor.backend {
            ExecutorBackend::Sequential => async move { self.run_unit(unit).await.map(|()| unit) }.boxed(),
            ExecutorBackend::ThreadPool => {
                let handle = tokio::spawn(self.run_unit(unit).instrument(Span::current()));
                async move { join_unit(handle.await, unit) }.boxed()
            }
            ExecutorBackend::ProcessPool => {
                let runtime = tokio::runtime::Handle::current();
                let span = Span::current();
                let handle = tokio::task::spawn_blocking(move || {
                    let _entered = span.enter();
                    runtime.block_on(self.run_unit(unit))
                });
                async move { join_unit(handle.await, unit) }.boxed()
            }
        }
    }

    async fn run_unit(self: Arc<Self>, unit: usize) -> Result<(), EngineError> {
        let steps = &self.plan.units()[unit].steps;

        if self.is_cancelled() {
            for &index in steps {
                self.mark_not_started(index);
            }
            return Ok(());
        }

        for (position, &index) in steps.iter().enumerate() {
            if self.execute_step(index).await? == StepFlow::Halt {
                let failed = self.graph.node(index).descriptor.name();
                for &rest in &steps[position + 1..] {
                    self.mark_dependency_failed(rest, failed);
                }
                break;
            }
        }
        Ok(())
    }

    async fn execute_step(&self, index: usize) -> Result<StepFlow, EngineError> {
        let step = &self.graph.node(index).descriptor;
        let name = step.name();

        // Restored from a checkpoint, or blocked by a failed upstream step.
        if self.status_of(name).is_some_and(|s| s.is_terminal()) {
            return Ok(StepFlow::Continue);
        }

        let snapshot = self.snapshot();
        let absent_inputs = match self.evaluator.evaluate_step(index, &snapshot) {
            Decision::Skip { reason } => {
                self.record_skip(name, reason);
                return Ok(StepFlow::Continue);
            }
            Decision::Run { absent_inputs } => absent_inputs,
        };
        if !absent_inputs.is_empty() {
            debug!(run_id = %self.run_id, step = %name, absent = ?absent_inputs, "Passing absent inputs as null");
        }

        let inputs: BTreeMap<String, Value> = step
            .inputs()
            .iter()
            .map(|input| {
                let value = snapshot.output(input).cloned().unwrap_or(Value::Null);
                (input.clone(), value)
            })
            .collect();
        let key_inputs: Vec<(&str, &Value)> = step
            .inputs()
            .iter()
            .filter_map(|input| inputs.get(input).map(|v| (input.as_str(), v)))
            .collect();

        let cache = &self.services.cache;
        let key = cache.key_for(step, &key_inputs, &self.params);
        let _guard = match &key {
            Some(key) => {
                let guard = cache.lock_key(key).await;
                let decision = cache.lookup(key).await?;
                if let (true, Some(entry), Some(values)) = (decision.hit, decision.entry, decision.outputs) {
                    self.record_cached(name, key, entry.outputs, values).await?;
                    return Ok(StepFlow::Continue);
                }
                Some(guard)
            }
            None => None,
        };

        self.mark_running(name);
        self.emit(
            events::STEP_STARTED,
            json!({"run_id": self.run_id, "step": name, "cache_key": key.as_ref().map(CacheKey::as_str)}),
        );

        let ctx = StepContext::new(self.run_id.clone(), name)
            .with_inputs(inputs)
            .with_params(step.select_params(&self.params));
        let started_at = Utc::now();
        let timer = Instant::now();
        let outcome = self
            .services
            .wrapper
            .invoke(step, ctx)
            .instrument(step_span(&self.run_id, name))
            .await;
        let duration_ms = timer.elapsed().as_secs_f64() * 1000.0;

        match outcome.result {
            Ok(outputs) => {
                // Fallback outputs are kept for this run only.
                let cache_key = if outcome.fallback_used { None } else { key };
                let refs = match &cache_key {
                    Some(key) => cache.store(step, key, &outputs).await?.outputs,
                    None => persist_outputs(self.services.artifacts.as_ref(), &outputs).await?,
                };
                self.services
                    .checkpoints
                    .record_completion(CheckpointRecord::completed(self.run_id.clone(), name, refs.clone()))
                    .await?;

                info!(
                    run_id = %self.run_id,
                    step = %name,
                    attempts = outcome.attempts,
                    fallback = outcome.fallback_used,
                    duration_ms,
                    "Step completed"
                );
                self.emit(
                    events::STEP_COMPLETED,
                    json!({
                        "run_id": self.run_id,
                        "step": name,
                        "attempts": outcome.attempts,
                        "fallback": outcome.fallback_used,
                        "duration_ms": duration_ms,
                    }),
                );
                self.publish_values(outputs);
                self.record(
                    StepResult::completed(name, refs)
                        .with_attempts(outcome.attempts, outcome.circuit_rejections)
                        .with_fallback(outcome.fallback_used)
                        .with_cache_key(cache_key.map(|k| k.to_string()))
                        .with_timing(started_at, duration_ms),
                );
                Ok(StepFlow::Continue)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(
                    run_id = %self.run_id,
                    step = %name,
                    attempts = outcome.attempts,
                    error_class = %err.class(),
                    error = %message,
                    "Step failed"
                );
                self.emit(
                    events::STEP_FAILED,
                    json!({
                        "run_id": self.run_id,
                        "step": name,
                        "status": StepStatus::Failed,
                        "error": message,
                        "error_class": err.class(),
                        "attempts": outcome.attempts,
                    }),
                );
                self.record(
                    StepResult::failed(name, message.clone(), err.class())
                        .with_attempts(outcome.attempts, outcome.circuit_rejections)
                        .with_timing(started_at, duration_ms),
                );
                self.first_failure
                    .lock()
                    .get_or_insert_with(|| (name.to_string(), message));

                for dependent in self.graph.transitive_dependents(index) {
                    self.mark_dependency_failed(dependent, name);
                }
                Ok(StepFlow::Halt)
            }
        }
    }

    async fn record_cached(
        &self,
        step: &str,
        key: &CacheKey,
        refs: BTreeMap<String, ArtifactRef>,
        values: StepOutputs,
    ) -> Result<(), EngineError> {
        self.services
            .checkpoints
            .record_completion(CheckpointRecord::completed(self.run_id.clone(), step, refs.clone()).with_cached(true))
            .await?;

        info!(run_id = %self.run_id, step = %step, cache_key = %key, "Step served from cache");
        self.emit(
            events::STEP_CACHED,
            json!({"run_id": self.run_id, "step": step, "cache_key": key.as_str()}),
        );
        self.publish_values(values);
        self.record(StepResult::cached(step, refs).with_cache_key(Some(key.to_string())));
        Ok(())
    }

    fn record_skip(&self, step: &str, reason: String) {
        info!(run_id = %self.run_id, step = %step, reason = %reason, "Step skipped");
        self.emit(
            events::STEP_SKIPPED,
            json!({"run_id": self.run_id, "step": step, "reason": reason}),
        );
        self.skipped.write().insert(step.to_string());
        self.record(StepResult::skipped(step, reason));
    }

    fn mark_running(&self, step: &str) {
        let mut run = self.run.write();
        if let Some(result) = run.steps.get_mut(step) {
            result.status = StepStatus::Running;
            result.started_at = Some(Utc::now());
        }
    }

    fn mark_dependency_failed(&self, index: usize, upstream: &str) {
        let step = self.graph.node(index).descriptor.name();
        {
            let mut run = self.run.write();
            if run.step(step).is_some_and(|r| r.status.is_terminal()) {
                return;
            }
            run.record(StepResult::dependency_failed(step, upstream));
        }
        debug!(run_id = %self.run_id, step = %step, upstream = %upstream, "Step blocked by failed upstream step");
        self.emit(
            events::STEP_FAILED,
            json!({
                "run_id": self.run_id,
                "step": step,
                "status": StepStatus::DependencyFailed,
                "upstream": upstream,
            }),
        );
    }

    fn mark_not_started(&self, index: usize) {
        let step = self.graph.node(index).descriptor.name();
        let mut run = self.run.write();
        if !run.step(step).is_some_and(|r| r.status.is_terminal()) {
            run.record(StepResult::not_started(step));
        }
    }

    fn finish(&self, outcome: Result<(), EngineError>) -> Result<Run, EngineError> {
        let first_failure = self.first_failure.lock().clone();
        let run = {
            let mut run = self.run.write();
            let unfinished: Vec<String> = run
                .steps
                .values()
                .filter(|r| !r.status.is_terminal())
                .map(|r| r.step.clone())
                .collect();
            for step in unfinished {
                run.record(StepResult::not_started(step));
            }
            run.cancelled =
                self.is_cancelled() && !run.steps_with_status(StepStatus::NotStarted).is_empty();
            run.finish(first_failure);
            run.clone()
        };

        let data = json!({
            "run_id": run.run_id,
            "pipeline": run.pipeline,
            "status": run.status,
            "cancelled": run.cancelled,
            "executed": run.executed_steps(),
            "cached": run.cached_steps(),
        });
        if run.is_success() {
            info!(run_id = %run.run_id, "Run completed");
            self.emit(events::RUN_COMPLETED, data);
        } else {
            warn!(
                run_id = %run.run_id,
                cancelled = run.cancelled,
                failed_step = ?run.failure.as_ref().and_then(|f| f.first_failed_step.as_ref()),
                "Run failed"
            );
            self.emit(events::RUN_FAILED, data);
        }

        outcome.map(|()| run)
    }
}

fn join_unit(
    joined: Result<Result<(), EngineError>, tokio::task::JoinError>,
    unit: usize,
) -> Result<usize, EngineError> {
    match joined {
        Ok(result) => result.map(|()| unit),
        Err(err) => Err(EngineError::Runtime(format!("execution unit {unit} aborted: {err}"))),
    }
}
