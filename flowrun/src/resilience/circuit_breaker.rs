//! Per-step circuit breaker.
//!
//! ## States
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected without invoking the step
//! - **HalfOpen**: the timeout elapsed; exactly one trial call is admitted
//!
//! A successful trial closes the circuit, a failed one reopens it with a
//! fresh timeout.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Calls are rejected.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Circuit breaker configuration of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            #[allow(clippy::cast_possible_truncation)]
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Returns the open timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, call normally.
    Allowed,
    /// The single half-open trial call.
    Trial,
    /// Circuit open, do not call.
    Rejected,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// When the last failure was recorded.
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding a single step.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Returns the guarded step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// Returns the current state, moving `Open` to `HalfOpen` once the timeout elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Returns a snapshot of the breaker.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
            if elapsed >= self.policy.timeout() {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = false;
            }
        }
    }

    /// Asks for permission to invoke the step.
    pub fn acquire(&self) -> Admission {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(step = %self.name, "Circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.policy.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        step = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(step = %self.name, "Circuit breaker reopened after failed trial");
            }
            CircuitState::Open => {}
        }
    }

    /// Resets to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.last_failure_at = None;
        inner.trial_in_flight = false;
    }
}

/// Breakers keyed by step name, living as long as the engine.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker of a step, creating it with `policy` on first use.
    #[must_use]
    pub fn get_or_create(&self, step: &str, policy: &CircuitBreakerPolicy) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(step.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(step, policy.clone())))
            .clone()
    }

    /// Returns the breaker of a step if one exists.
    #[must_use]
    pub fn get(&self, step: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(step).map(|b| b.value().clone())
    }

    /// Returns the state of a step's breaker.
    #[must_use]
    pub fn state(&self, step: &str) -> Option<CircuitState> {
        self.get(step).map(|b| b.state())
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }

    /// Number of tracked breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("s", CircuitBreakerPolicy::new(threshold, Duration::from_millis(timeout_ms)))
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 10_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.acquire(), Admission::Allowed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.acquire(), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(3, 10_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = breaker(1, 20);
        cb.record_failure();
        assert_eq!(cb.acquire(), Admission::Rejected);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.acquire(), Admission::Trial);
        assert_eq!(cb.acquire(), Admission::Rejected);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.acquire(), Admission::Allowed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker(1, 20);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.acquire(), Admission::Trial);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.acquire(), Admission::Rejected);
        assert!(cb.snapshot().last_failure_at.is_some());
    }

    #[test]
    fn test_registry_shares_breaker_per_step() {
        let registry = CircuitBreakerRegistry::new();
        let policy = CircuitBreakerPolicy::new(1, Duration::from_secs(60));

        let a = registry.get_or_create("fetch", &policy);
        a.record_failure();
        let again = registry.get_or_create("fetch", &policy);

        assert_eq!(again.state(), CircuitState::Open);
        assert_eq!(registry.state("other"), None);
        assert_eq!(registry.len(), 1);

        registry.reset_all();
        assert_eq!(registry.state("fetch"), Some(CircuitState::Closed));
    }
}
