//! Resilience policies applied around step logic.
//!
//! This module provides:
//! - Retry with exponential backoff and jitter
//! - A per-step circuit breaker
//! - The wrapper combining both with an optional fallback

mod circuit_breaker;
mod retry;
mod wrapper;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerPolicy, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitState,
};
pub use retry::{JitterStrategy, RetryDecision, RetryOn, RetryPolicy};
pub use wrapper::{
    InvocationOutcome, ResilienceState, ResilienceWrapper, MISSING_OUTPUT_ERROR, STEP_PANIC,
};
