//! Step logic trait and the context passed to it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::StepError;

/// Named output values produced by one step invocation.
pub type StepOutputs = BTreeMap<String, Value>;

/// Everything a step invocation can see.
///
/// `params` only holds the run parameters the step declared, so every value
/// the logic reads also participates in its cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    /// The run identifier.
    pub run_id: String,
    /// The step name.
    pub step: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Input values by name. Inputs of skipped producers are `null`.
    pub inputs: BTreeMap<String, Value>,
    /// Declared run parameters by name.
    pub params: BTreeMap<String, Value>,
}

impl StepContext {
    /// Creates a context for the first attempt.
    #[must_use]
    pub fn new(run_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step: step.into(),
            attempt: 1,
            inputs: BTreeMap::new(),
            params: BTreeMap::new(),
        }
    }

    /// Sets the inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Returns an input value.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Returns an input value, failing if it is missing or `null`.
    pub fn require_input(&self, name: &str) -> Result<&Value, StepError> {
        match self.inputs.get(name) {
            Some(Value::Null) | None => Err(StepError::with_class(
                "MissingInputError",
                format!("Step '{}' has no value for input '{name}'", self.step),
            )),
            Some(value) => Ok(value),
        }
    }

    /// Returns a run parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Returns an input as `f64`.
    #[must_use]
    pub fn input_f64(&self, name: &str) -> Option<f64> {
        self.input(name).and_then(Value::as_f64)
    }

    /// Returns an input as `i64`.
    #[must_use]
    pub fn input_i64(&self, name: &str) -> Option<i64> {
        self.input(name).and_then(Value::as_i64)
    }

    /// Returns an input as a string slice.
    #[must_use]
    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.input(name).and_then(Value::as_str)
    }
}

/// The executable part of a step.
#[async_trait]
pub trait StepLogic: Send + Sync + fmt::Debug {
    /// Runs the step and returns its outputs.
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs, StepError>;

    /// Stable content fingerprint of the logic, if the logic knows one.
    ///
    /// Used when the step descriptor declares no fingerprint of its own.
    fn fingerprint(&self) -> Option<String> {
        None
    }
}

type StepFn = dyn Fn(&StepContext) -> Result<StepOutputs, StepError> + Send + Sync;

/// Step logic backed by a synchronous closure.
#[derive(Clone)]
pub struct FnStep {
    name: String,
    func: Arc<StepFn>,
}

impl FnStep {
    /// Wraps a closure.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepContext) -> Result<StepOutputs, StepError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl StepLogic for FnStep {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs, StepError> {
        (self.func)(ctx)
    }
}
