//! Test doubles for pipelines.
//!
//! Ready-made [`StepLogic`](crate::pipeline::StepLogic) implementations for
//! exercising the engine: constant producers, failing and panicking steps,
//! slow steps and a call-counting decorator.

mod steps;

pub use crate::pipeline::FnStep;
pub use steps::{CallCounter, ConstStep, CountingStep, FailingStep, PanicStep, SleepStep};
