//! # Flowrun
//!
//! A local-first pipeline execution engine.
//!
//! Flowrun runs directed acyclic graphs of steps that exchange named
//! outputs, with support for:
//!
//! - **Data-driven graphs**: edges are inferred from the inputs and outputs steps declare
//! - **Content-addressed caching**: results are keyed by code fingerprint, inputs and parameters
//! - **Checkpoint and resume**: a rerun with the same run id skips completed steps
//! - **Resilience policies**: retry with backoff, per-step circuit breakers and fallbacks
//! - **Conditional execution**: skip predicates and `If` branches
//! - **Executor backends**: sequential, task pool and blocking pool
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowrun::prelude::*;
//! use serde_json::json;
//!
//! let graph = PipelineBuilder::new("etl")
//!     .external_input("raw")
//!     .step(StepDescriptor::new("clean", CleanStep).with_inputs(["raw"]).with_outputs(["rows"]))
//!     .step(StepDescriptor::new("train", TrainStep).with_inputs(["rows"]).with_outputs(["model"]))
//!     .build()?;
//!
//! let engine = Engine::in_memory();
//! let run = engine.run(&graph, RunRequest::new().with_input("raw", json!([1, 2, 3]))).await?;
//! assert!(run.is_success());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cache;
pub mod cancellation;
pub mod checkpoint;
pub mod conditions;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactRef, ArtifactStore};
    pub use crate::cache::{CacheStats, CacheStrategy};
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::CheckpointStore;
    pub use crate::conditions::{always, condition_fn, Condition, If, RunSnapshot};
    pub use crate::config::EngineConfig;
    pub use crate::core::{ResourceRequirement, Run, RunStatus, StepResult, StepStatus};
    pub use crate::errors::{EngineError, GraphValidationError, ResilienceError, StepError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{Engine, ExecutorBackend, ExecutorConfig, RunRequest};
    pub use crate::pipeline::{
        define_pipeline, FnStep, PipelineBuilder, PipelineGraph, StepContext, StepDescriptor,
        StepLogic, StepOutputs,
    };
    pub use crate::resilience::{CircuitBreakerPolicy, JitterStrategy, RetryPolicy};
}
