//! Error types for the flowrun engine.
//!
//! The taxonomy separates build-time graph problems, failures raised by step
//! logic, synthetic failures produced by the resilience layer, and run-level
//! errors that abort a run before or outside of step execution.

use thiserror::Error;

/// Error class assigned to step failures that don't name one explicitly.
pub const STEP_EXECUTION_ERROR: &str = "StepExecutionError";

/// Raised while building a pipeline graph. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    /// A step requires an input that no step produces and that isn't external.
    #[error("Step '{step}' requires input '{input}' which no step produces and which is not an external input")]
    UnresolvedInput {
        /// The consuming step.
        step: String,
        /// The unresolved input name.
        input: String,
    },

    /// The graph contains a cycle.
    #[error("Cycle detected in pipeline: {}", path.join(" -> "))]
    Cycle {
        /// Step names forming the cycle; the first name is repeated at the end.
        path: Vec<String>,
    },

    /// Two sources claim the same output name.
    #[error("Output '{output}' is produced by more than one source: {}", producers.join(", "))]
    DuplicateOutput {
        /// The contested output name.
        output: String,
        /// The competing producers (`<external>` for an external input).
        producers: Vec<String>,
    },

    /// A step name was registered twice.
    #[error("Step '{0}' is registered more than once")]
    DuplicateStep(String),

    /// The pipeline has no steps.
    #[error("Pipeline '{0}' has no steps")]
    EmptyPipeline(String),

    /// The pipeline name is empty or whitespace.
    #[error("Pipeline name cannot be empty or whitespace-only")]
    EmptyName,

    /// A step was declared with an empty name.
    #[error("Step names cannot be empty")]
    EmptyStepName,

    /// A branch declaration is malformed.
    #[error("Invalid branch '{name}': {reason}")]
    InvalidBranch {
        /// The branch name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl GraphValidationError {
    /// Returns a stable error code for diagnostics.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvedInput { .. } => "GRAPH-UNRESOLVED_INPUT",
            Self::Cycle { .. } => "GRAPH-CYCLE",
            Self::DuplicateOutput { .. } => "GRAPH-DUPLICATE_OUTPUT",
            Self::DuplicateStep(_) => "GRAPH-DUPLICATE_STEP",
            Self::EmptyPipeline(_) => "GRAPH-EMPTY",
            Self::EmptyName | Self::EmptyStepName => "GRAPH-EMPTY_NAME",
            Self::InvalidBranch { .. } => "GRAPH-INVALID_BRANCH",
        }
    }

    /// Returns a hint for fixing the error.
    #[must_use]
    pub fn fix_hint(&self) -> &'static str {
        match self {
            Self::UnresolvedInput { .. } => {
                "Add a step that produces the input, or declare it as an external input."
            }
            Self::Cycle { .. } => "Remove one of the data dependencies in the cycle to break it.",
            Self::DuplicateOutput { .. } => "Rename one of the outputs so every name has a single producer.",
            Self::DuplicateStep(_) => "Step names must be unique within a pipeline.",
            Self::EmptyPipeline(_) => "Add at least one step to the pipeline before building.",
            Self::EmptyName | Self::EmptyStepName => "Provide a non-empty name.",
            Self::InvalidBranch { .. } => {
                "Give each branch a unique name and two distinct, otherwise untargeted steps."
            }
        }
    }

    /// Returns the step names involved in the error.
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        match self {
            Self::UnresolvedInput { step, .. } => vec![step.clone()],
            Self::Cycle { path } => path.clone(),
            Self::DuplicateOutput { producers, .. } => producers.clone(),
            Self::DuplicateStep(step) => vec![step.clone()],
            Self::EmptyPipeline(_) | Self::EmptyName | Self::EmptyStepName | Self::InvalidBranch { .. } => {
                Vec::new()
            }
        }
    }
}

/// A failure raised by step logic.
///
/// The `class` names the kind of failure and is what retry policies match on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct StepError {
    /// Human-readable message.
    pub message: String,
    /// Error class name.
    pub class: String,
}

impl StepError {
    /// Creates a step error with the default class.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: STEP_EXECUTION_ERROR.to_string(),
        }
    }

    /// Creates a step error with an explicit class.
    #[must_use]
    pub fn with_class(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: class.into(),
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        Self::with_class("IoError", err.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_class("SerializationError", err.to_string())
    }
}

/// Terminal error of a resilience-wrapped invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// The circuit was open; the step was not invoked.
    #[error("Circuit open for step '{step}'")]
    CircuitOpen {
        /// The guarded step.
        step: String,
    },

    /// All attempts failed.
    #[error("Step '{step}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// The step.
        step: String,
        /// Number of attempts made.
        attempts: u32,
        /// The error of the final attempt.
        last_error: StepError,
    },

    /// The step failed with an error the retry policy does not cover.
    #[error(transparent)]
    Step(StepError),
}

impl ResilienceError {
    /// Returns the error class used in step results.
    #[must_use]
    pub fn class(&self) -> &str {
        match self {
            Self::CircuitOpen { .. } => "CircuitOpenError",
            Self::RetryExhausted { .. } => "RetryExhaustedError",
            Self::Step(err) => &err.class,
        }
    }
}

/// Recorded for a step that never ran because an upstream step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Step '{step}' not executed: upstream step '{upstream}' failed")]
pub struct DependencyFailedError {
    /// The step that was not executed.
    pub step: String,
    /// The failed upstream step.
    pub upstream: String,
}

impl DependencyFailedError {
    /// Error class used in step results.
    pub const CLASS: &'static str = "DependencyFailedError";

    /// Creates a new dependency-failed error.
    #[must_use]
    pub fn new(step: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            upstream: upstream.into(),
        }
    }
}

/// Failures of the cache, checkpoint and artifact backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Run-level errors returned by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pipeline graph is invalid.
    #[error("{0}")]
    Validation(#[from] GraphValidationError),

    /// A checkpoint references an output that can no longer be resolved.
    #[error("Checkpoint for step '{step}' in run '{run_id}' references unresolvable output '{reference}'")]
    CheckpointInconsistency {
        /// The run being resumed.
        run_id: String,
        /// The checkpointed step.
        step: String,
        /// The dangling output reference.
        reference: String,
    },

    /// A declared external input was not supplied at run start.
    #[error("External input '{0}' was not supplied")]
    MissingExternalInput(String),

    /// A storage backend failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The async runtime could not be created or a task failed.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = GraphValidationError::Cycle {
            path: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.code(), "GRAPH-CYCLE");
        assert_eq!(err.steps().len(), 4);
    }

    #[test]
    fn test_unresolved_input_message() {
        let err = GraphValidationError::UnresolvedInput {
            step: "train".into(),
            input: "features".into(),
        };

        assert!(err.to_string().contains("'features'"));
        assert!(err.fix_hint().contains("external input"));
        assert_eq!(err.steps(), vec!["train".to_string()]);
    }

    #[test]
    fn test_step_error_classes() {
        let err = StepError::new("boom");
        assert_eq!(err.class, STEP_EXECUTION_ERROR);
        assert_eq!(err.to_string(), "StepExecutionError: boom");

        let io: StepError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(io.class, "IoError");
    }

    #[test]
    fn test_step_error_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("root cause").context("loading dataset");
        let step_err = StepError::from(err);

        assert_eq!(step_err.message, "loading dataset: root cause");
    }

    #[test]
    fn test_resilience_error_class() {
        assert_eq!(
            ResilienceError::CircuitOpen { step: "s".into() }.class(),
            "CircuitOpenError"
        );
        let exhausted = ResilienceError::RetryExhausted {
            step: "s".into(),
            attempts: 3,
            last_error: StepError::new("x"),
        };
        assert_eq!(exhausted.class(), "RetryExhaustedError");
        assert!(exhausted.to_string().contains("after 3 attempts"));
        assert_eq!(
            ResilienceError::Step(StepError::with_class("Timeout", "slow")).class(),
            "Timeout"
        );
    }

    #[test]
    fn test_dependency_failed_message() {
        let err = DependencyFailedError::new("report", "train");
        assert_eq!(
            err.to_string(),
            "Step 'report' not executed: upstream step 'train' failed"
        );
    }
}
