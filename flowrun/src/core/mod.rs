//! Core domain model types for flowrun.
//!
//! This module contains the records the engine produces and that dashboards,
//! trackers and other consumers read:
//! - Step and run status enums
//! - Step results and the run record
//! - Resource requirements and their aggregation

mod resources;
mod result;
mod run;
mod status;

pub use resources::{GpuType, ResourceRequirement};
pub use result::StepResult;
pub use run::{Run, RunFailure};
pub use status::{RunStatus, StepStatus};
