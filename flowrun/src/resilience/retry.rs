//! Retry policy with exponential backoff and optional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::StepError;

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Which error classes trigger a retry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Retry on every error class.
    #[default]
    All,
    /// Retry only on the listed error classes.
    Classes(Vec<String>),
}

impl RetryOn {
    /// Returns true if `error` should be retried.
    #[must_use]
    pub fn matches(&self, error: &StepError) -> bool {
        match self {
            Self::All => true,
            Self::Classes(classes) => classes.iter().any(|c| c == &error.class),
        }
    }
}

/// Retry configuration of a step.
///
/// The delay before attempt `n + 1` is `initial * multiplier^(n - 1)`, capped
/// at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Growth factor applied per further retry.
    pub multiplier: f64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Error classes that trigger a retry.
    #[serde(default)]
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: JitterStrategy::None,
            retry_on: RetryOn::All,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No attempts left.
    GiveUp,
    /// The error class is not covered by the policy.
    NotRetryable,
}

impl RetryPolicy {
    /// Creates a policy that makes a single attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy with `max_attempts` total attempts.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self::default().with_max_attempts(max_attempts)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restricts retries to the given error classes.
    #[must_use]
    pub fn retry_on<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = RetryOn::Classes(classes.into_iter().map(Into::into).collect());
        self
    }

    /// Backoff delay after the given failed attempt (1-based), before jitter.
    #[must_use]
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(0.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped.round() as u64)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let millis = delay.as_millis() as u64;
        let jittered = match self.jitter {
            JitterStrategy::None => millis,
            JitterStrategy::Full => {
                if millis == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=millis)
                }
            }
            JitterStrategy::Equal => {
                let half = millis / 2;
                if half == 0 {
                    millis
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }

    /// Decides what happens after `failed_attempt` (1-based) failed with `error`.
    #[must_use]
    pub fn decide(&self, error: &StepError, failed_attempt: u32) -> RetryDecision {
        if !self.retry_on.matches(error) {
            return RetryDecision::NotRetryable;
        }
        if failed_attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.apply_jitter(self.backoff_delay(failed_attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_makes_one_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(
            policy.decide(&StepError::new("x"), 1),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_backoff_formula() {
        let policy = RetryPolicy::attempts(5)
            .with_initial_delay_ms(100)
            .with_multiplier(3.0);

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(300));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(900));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = RetryPolicy::attempts(20)
            .with_initial_delay_ms(1000)
            .with_max_delay_ms(5000);

        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_decide_until_exhausted() {
        let policy = RetryPolicy::attempts(3).with_initial_delay_ms(10);
        let err = StepError::new("transient");

        assert_eq!(policy.decide(&err, 1), RetryDecision::Retry(Duration::from_millis(10)));
        assert_eq!(policy.decide(&err, 2), RetryDecision::Retry(Duration::from_millis(20)));
        assert_eq!(policy.decide(&err, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_on_classes() {
        let policy = RetryPolicy::attempts(3).retry_on(["Timeout"]);

        assert!(matches!(
            policy.decide(&StepError::with_class("Timeout", "slow"), 1),
            RetryDecision::Retry(_)
        ));
        assert_eq!(
            policy.decide(&StepError::new("bad input"), 1),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::attempts(3)
            .with_initial_delay_ms(100)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..20 {
            match policy.decide(&StepError::new("x"), 1) {
                RetryDecision::Retry(delay) => assert!(delay <= Duration::from_millis(100)),
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "initial_delay_ms": 50, "multiplier": 2.0, "max_delay_ms": 1000}"#,
        )
        .unwrap();

        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.jitter, JitterStrategy::None);
        assert_eq!(policy.retry_on, RetryOn::All);
    }
}
