//! Pipeline execution.
//!
//! This module provides:
//! - [`Engine`], the entry point owning stores and resilience state
//! - [`RunRequest`] describing one run
//! - Executor backends and the run registry

mod config;
mod engine;
mod registry;
mod scheduler;


pub use config::{ExecutorBackend, ExecutorConfig};
pub use engine::{Engine, EngineBuilder};
pub use registry::RunRegistry;
pub use scheduler::RunRequest;
