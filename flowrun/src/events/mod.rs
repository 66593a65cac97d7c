//! Engine lifecycle events.
//!
//! The engine emits one event per run and step transition to the
//! [`EventSink`] it was built with. Dashboards, trackers and notifiers consume
//! these; the engine never calls them directly.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run started.
pub const RUN_STARTED: &str = "run.started";
/// A run completed successfully.
pub const RUN_COMPLETED: &str = "run.completed";
/// A run finished with failures or was cancelled.
pub const RUN_FAILED: &str = "run.failed";
/// A step is about to execute.
pub const STEP_STARTED: &str = "step.started";
/// A step produced its outputs.
pub const STEP_COMPLETED: &str = "step.completed";
/// A step was served from the cache or a checkpoint.
pub const STEP_CACHED: &str = "step.cached";
/// A step was skipped by condition logic.
pub const STEP_SKIPPED: &str = "step.skipped";
/// A step failed or was blocked by a failed upstream step.
pub const STEP_FAILED: &str = "step.failed";
/// A failed attempt will be retried.
pub const STEP_RETRYING: &str = "step.retrying";
