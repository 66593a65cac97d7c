//! Pipeline declaration and planning.
//!
//! This module provides:
//! - Step logic and step descriptors
//! - Pipeline builder with validation
//! - The arena-backed pipeline graph
//! - Execution planning into units

mod builder;
mod graph;
mod logic;
mod planner;
mod step;

pub use builder::{define_pipeline, PipelineBuilder};
pub use graph::{InputSource, PipelineGraph, StepNode, EXTERNAL_PRODUCER};
pub use logic::{FnStep, StepContext, StepLogic, StepOutputs};
pub use planner::{plan, ExecutionPlan, ExecutionUnit};
pub use step::StepDescriptor;
