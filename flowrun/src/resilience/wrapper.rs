//! Wraps one step invocation with retry, circuit breaker and fallback.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use super::circuit_breaker::{Admission, CircuitBreakerRegistry};
use super::retry::RetryDecision;
use crate::errors::{ResilienceError, StepError};
use crate::events::{self, EventSink};
use crate::pipeline::{StepContext, StepDescriptor, StepLogic, StepOutputs};

/// Error class of a step whose logic panicked.
pub const STEP_PANIC: &str = "StepPanic";

/// Error class of a step that returned without one of its declared outputs.
pub const MISSING_OUTPUT_ERROR: &str = "MissingOutputError";

/// States of one wrapped invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResilienceState {
    /// Nothing happened yet.
    Idle,
    /// The step logic is running.
    Attempting,
    /// Waiting before the next attempt.
    Retrying,
    /// The circuit rejected the call.
    CircuitOpen,
    /// The fallback is running.
    FallbackInvoked,
    /// Outputs were produced.
    Success,
    /// The invocation failed for good.
    Failed,
}

impl fmt::Display for ResilienceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Attempting => "attempting",
            Self::Retrying => "retrying",
            Self::CircuitOpen => "circuit_open",
            Self::FallbackInvoked => "fallback_invoked",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Result of a wrapped invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// Outputs or the terminal error.
    pub result: Result<StepOutputs, ResilienceError>,
    /// Times the step logic was invoked.
    pub attempts: u32,
    /// Calls rejected by the circuit breaker.
    pub circuit_rejections: u32,
    /// Whether the outputs came from the fallback.
    pub fallback_used: bool,
    /// State machine trace, starting at `Idle`.
    pub transitions: Vec<ResilienceState>,
}

impl InvocationOutcome {
    /// Returns true if outputs were produced.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns the final state.
    #[must_use]
    pub fn final_state(&self) -> ResilienceState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(ResilienceState::Idle)
    }
}

/// Applies a step's resilience policies around its logic.
#[derive(Clone)]
pub struct ResilienceWrapper {
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for ResilienceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceWrapper")
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "step panicked".to_string())
}

/// Runs step logic, turning a panic into a [`StepError`].
async fn run_logic(logic: &dyn StepLogic, ctx: &StepContext) -> Result<StepOutputs, StepError> {
    match AssertUnwindSafe(logic.execute(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(StepError::with_class(STEP_PANIC, panic_message(payload.as_ref()))),
    }
}

/// Enforces the declared output contract: every declared output must be
/// present, undeclared ones are dropped.
fn check_outputs(step: &StepDescriptor, mut outputs: StepOutputs) -> Result<StepOutputs, StepError> {
    if let Some(missing) = step.outputs().iter().find(|o| !outputs.contains_key(*o)) {
        return Err(StepError::with_class(
            MISSING_OUTPUT_ERROR,
            format!("step '{}' did not produce declared output '{missing}'", step.name()),
        ));
    }
    outputs.retain(|name, _| {
        let declared = step.outputs().iter().any(|o| o == name);
        if !declared {
            debug!(step = %step.name(), output = %name, "Dropping undeclared output");
        }
        declared
    });
    Ok(outputs)
}

impl ResilienceWrapper {
    /// Creates a wrapper sharing the engine's breaker registry and event sink.
    #[must_use]
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self { breakers, events }
    }

    /// Invokes `step` with `ctx`, applying its retry, breaker and fallback policies.
    pub async fn invoke(&self, step: &StepDescriptor, mut ctx: StepContext) -> InvocationOutcome {
        let name = step.name();
        let policy = step.retry_policy();
        let breaker = step
            .circuit_breaker()
            .map(|p| self.breakers.get_or_create(name, p));

        let mut transitions = vec![ResilienceState::Idle];
        let mut attempts = 0u32;
        let mut circuit_rejections = 0u32;

        let error = loop {
            if let Some(breaker) = &breaker {
                if breaker.acquire() == Admission::Rejected {
                    circuit_rejections += 1;
                    transitions.push(ResilienceState::CircuitOpen);
                    debug!(run_id = %ctx.run_id, step = %name, "Circuit open, call rejected");
                    break ResilienceError::CircuitOpen {
                        step: name.to_string(),
                    };
                }
            }

            attempts += 1;
            ctx.attempt = attempts;
            transitions.push(ResilienceState::Attempting);

            let result = run_logic(step.logic().as_ref(), &ctx)
                .await
                .and_then(|outputs| check_outputs(step, outputs));
            match result {
                Ok(outputs) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    transitions.push(ResilienceState::Success);
                    return InvocationOutcome {
                        result: Ok(outputs),
                        attempts,
                        circuit_rejections,
                        fallback_used: false,
                        transitions,
                    };
                }
                Err(err) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    match policy.decide(&err, attempts) {
                        RetryDecision::Retry(delay) => {
                            transitions.push(ResilienceState::Retrying);
                            warn!(
                                run_id = %ctx.run_id,
                                step = %name,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Step attempt failed, retrying"
                            );
                            self.events.try_emit(
                                events::STEP_RETRYING,
                                Some(json!({
                                    "run_id": ctx.run_id,
                                    "step": name,
                                    "attempt": attempts,
                                    "delay_ms": delay.as_millis() as u64,
                                    "error": err.to_string(),
                                })),
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp if attempts > 1 => {
                            break ResilienceError::RetryExhausted {
                                step: name.to_string(),
                                attempts,
                                last_error: err,
                            };
                        }
                        RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                            break ResilienceError::Step(err);
                        }
                    }
                }
            }
        };

        if let Some(fallback) = step.fallback() {
            transitions.push(ResilienceState::FallbackInvoked);
            debug!(run_id = %ctx.run_id, step = %name, error = %error, "Invoking fallback");
            let result = run_logic(fallback.as_ref(), &ctx)
                .await
                .and_then(|outputs| check_outputs(step, outputs));
            match result {
                Ok(outputs) => {
                    transitions.push(ResilienceState::Success);
                    return InvocationOutcome {
                        result: Ok(outputs),
                        attempts,
                        circuit_rejections,
                        fallback_used: true,
                        transitions,
                    };
                }
                Err(fallback_err) => {
                    warn!(
                        run_id = %ctx.run_id,
                        step = %name,
                        error = %fallback_err,
                        "Fallback failed"
                    );
                }
            }
        }

        transitions.push(ResilienceState::Failed);
        InvocationOutcome {
            result: Err(error),
            attempts,
            circuit_rejections,
            fallback_used: false,
            transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::resilience::{CircuitBreakerPolicy, RetryPolicy};
    use crate::testing::{ConstStep, CountingStep, FailingStep, PanicStep};
    use serde_json::json;
    use std::time::Duration;

    fn wrapper() -> ResilienceWrapper {
        ResilienceWrapper::new(Arc::new(CircuitBreakerRegistry::new()), Arc::new(NoOpEventSink))
    }

    fn ctx() -> StepContext {
        StepContext::new("run", "s")
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let step = StepDescriptor::new("s", ConstStep::single("x", json!(1)));
        let outcome = wrapper().invoke(&step, ctx()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.transitions,
            vec![ResilienceState::Idle, ResilienceState::Attempting, ResilienceState::Success]
        );
    }

    #[tokio::test]
    async fn test_retry_bound_is_exact() {
        let logic = CountingStep::new(FailingStep::new("always"));
        let calls = logic.counter();
        let step = StepDescriptor::new("s", logic)
            .with_retry(RetryPolicy::attempts(5).with_initial_delay_ms(1));

        let outcome = wrapper().invoke(&step, ctx()).await;

        assert_eq!(calls.get(), 5);
        assert_eq!(outcome.attempts, 5);
        match outcome.result {
            Err(ResilienceError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(outcome.final_state(), ResilienceState::Failed);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let step = StepDescriptor::new("s", FailingStep::new("flaky").succeed_after(2, "x", json!("ok")))
            .with_outputs(["x"])
            .with_retry(RetryPolicy::attempts(3).with_initial_delay_ms(1));
        let events = Arc::new(CollectingEventSink::new());
        let wrapper = ResilienceWrapper::new(Arc::new(CircuitBreakerRegistry::new()), events.clone());

        let outcome = wrapper.invoke(&step, ctx()).await;

        assert_eq!(outcome.result.unwrap()["x"], json!("ok"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(events.events_of_type("step.retrying").len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let step = StepDescriptor::new("s", FailingStep::with_class("ValueError", "bad"))
            .with_retry(RetryPolicy::attempts(5).with_initial_delay_ms(1).retry_on(["Timeout"]));

        let outcome = wrapper().invoke(&step, ctx()).await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap_err().class(), "ValueError");
    }

    #[tokio::test]
    async fn test_fallback_after_exhaustion() {
        let step = StepDescriptor::new("s", FailingStep::new("down"))
            .with_outputs(["x"])
            .with_retry(RetryPolicy::attempts(2).with_initial_delay_ms(1))
            .with_fallback(ConstStep::single("x", json!("default")));

        let outcome = wrapper().invoke(&step, ctx()).await;

        assert!(outcome.fallback_used);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap()["x"], json!("default"));
        assert!(outcome.transitions.contains(&ResilienceState::FallbackInvoked));
    }

    #[tokio::test]
    async fn test_circuit_rejects_without_invoking() {
        let logic = CountingStep::new(FailingStep::new("down"));
        let calls = logic.counter();
        let step = StepDescriptor::new("s", logic)
            .with_circuit_breaker(CircuitBreakerPolicy::new(3, Duration::from_millis(50)));
        let wrapper = wrapper();

        for _ in 0..3 {
            let outcome = wrapper.invoke(&step, ctx()).await;
            assert_eq!(outcome.result.unwrap_err().class(), "StepExecutionError");
        }
        assert_eq!(calls.get(), 3);

        let rejected = wrapper.invoke(&step, ctx()).await;
        assert_eq!(rejected.attempts, 0);
        assert_eq!(rejected.circuit_rejections, 1);
        assert_eq!(rejected.result.unwrap_err().class(), "CircuitOpenError");
        assert_eq!(calls.get(), 3);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let trial = wrapper.invoke(&step, ctx()).await;
        assert_eq!(trial.attempts, 1);
        assert_eq!(calls.get(), 4);

        let reopened = wrapper.invoke(&step, ctx()).await;
        assert_eq!(reopened.attempts, 0);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn test_fallback_when_circuit_open() {
        let step = StepDescriptor::new("s", FailingStep::new("down"))
            .with_circuit_breaker(CircuitBreakerPolicy::new(1, Duration::from_secs(60)))
            .with_fallback(ConstStep::single("x", json!("cached")));
        let wrapper = wrapper();

        let first = wrapper.invoke(&step, ctx()).await;
        assert!(first.fallback_used);

        let second = wrapper.invoke(&step, ctx()).await;
        assert!(second.fallback_used);
        assert_eq!(second.circuit_rejections, 1);
        assert_eq!(second.attempts, 0);
    }

    #[tokio::test]
    async fn test_missing_output_counts_as_failed_attempt() {
        let step = StepDescriptor::new("s", ConstStep::single("x", json!(1)))
            .with_outputs(["y"])
            .with_circuit_breaker(CircuitBreakerPolicy::new(1, Duration::from_secs(60)));
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let wrapper = ResilienceWrapper::new(registry.clone(), Arc::new(NoOpEventSink));

        let outcome = wrapper.invoke(&step, ctx()).await;

        assert_eq!(outcome.result.unwrap_err().class(), MISSING_OUTPUT_ERROR);
        let breaker = registry.get("s").unwrap();
        assert_eq!(breaker.state(), crate::resilience::CircuitState::Open);
    }

    #[tokio::test]
    async fn test_undeclared_outputs_are_dropped() {
        let step = StepDescriptor::new("s", ConstStep::single("x", json!(1)));
        let outcome = wrapper().invoke(&step, ctx()).await;
        assert!(outcome.result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_becomes_step_error() {
        let step = StepDescriptor::new("s", PanicStep::new("kaboom"));
        let outcome = wrapper().invoke(&step, ctx()).await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.class(), STEP_PANIC);
        assert!(err.to_string().contains("kaboom"));
    }
}
