//! Step logic doubles.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::StepError;
use crate::pipeline::{StepContext, StepLogic, StepOutputs};

/// A step that always returns the same outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstStep {
    outputs: StepOutputs,
}

impl ConstStep {
    /// Creates a step returning `outputs`.
    #[must_use]
    pub fn new(outputs: StepOutputs) -> Self {
        Self { outputs }
    }

    /// Creates a step returning a single output.
    #[must_use]
    pub fn single(name: impl Into<String>, value: Value) -> Self {
        Self::new(StepOutputs::from([(name.into(), value)]))
    }
}

#[async_trait]
impl StepLogic for ConstStep {
    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutputs, StepError> {
        Ok(self.outputs.clone())
    }
}

/// A step that fails, optionally recovering after a number of calls.
pub struct FailingStep {
    error: StepError,
    recover: Option<(usize, String, Value)>,
    calls: AtomicUsize,
}

impl FailingStep {
    /// Creates a step failing with a generic `StepError`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: StepError::new(message),
            recover: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a step failing with the given error class.
    #[must_use]
    pub fn with_class(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: StepError::with_class(class, message),
            recover: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails the first `failures` calls, then returns `output = value`.
    #[must_use]
    pub fn succeed_after(mut self, failures: usize, output: impl Into<String>, value: Value) -> Self {
        self.recover = Some((failures, output.into(), value));
        self
    }
}

impl fmt::Debug for FailingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailingStep")
            .field("error", &self.error)
            .field("recover", &self.recover)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StepLogic for FailingStep {
    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutputs, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.recover {
            Some((failures, output, value)) if call >= *failures => {
                Ok(StepOutputs::from([(output.clone(), value.clone())]))
            }
            _ => Err(self.error.clone()),
        }
    }
}

/// A step that panics.
#[derive(Debug, Clone)]
pub struct PanicStep {
    message: String,
}

impl PanicStep {
    /// Creates a step panicking with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl StepLogic for PanicStep {
    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutputs, StepError> {
        panic!("{}", self.message)
    }
}

/// A step that sleeps before returning its outputs.
#[derive(Debug, Clone)]
pub struct SleepStep {
    delay: Duration,
    outputs: StepOutputs,
    blocking: bool,
}

impl SleepStep {
    /// Creates a step that sleeps asynchronously for `delay`.
    #[must_use]
    pub fn new(delay: Duration, outputs: StepOutputs) -> Self {
        Self {
            delay,
            outputs,
            blocking: false,
        }
    }

    /// Sleeps on the executing thread instead of yielding.
    ///
    /// Models CPU-bound work.
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

#[async_trait]
impl StepLogic for SleepStep {
    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutputs, StepError> {
        if self.blocking {
            std::thread::sleep(self.delay);
        } else {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.outputs.clone())
    }
}

/// Shared view of a [`CountingStep`]'s call count.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Returns the number of calls so far.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decorator counting how often the wrapped logic executes.
///
/// The count is not part of the debug output, so wrapping does not disturb
/// fingerprints between runs.
pub struct CountingStep<L> {
    inner: L,
    calls: CallCounter,
}

impl<L: StepLogic> CountingStep<L> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            calls: CallCounter::default(),
        }
    }

    /// Returns a handle reading the call count.
    #[must_use]
    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl<L: fmt::Debug> fmt::Debug for CountingStep<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CountingStep").field(&self.inner).finish()
    }
}

#[async_trait]
impl<L: StepLogic> StepLogic for CountingStep<L> {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs, StepError> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx).await
    }

    fn fingerprint(&self) -> Option<String> {
        self.inner.fingerprint()
    }
}
