//! Step descriptors.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::logic::StepLogic;
use crate::cache::CacheStrategy;
use crate::conditions::Condition;
use crate::core::ResourceRequirement;
use crate::errors::GraphValidationError;
use crate::resilience::{CircuitBreakerPolicy, RetryPolicy};
use crate::utils::sha256_hex;

/// Declaration of one pipeline step.
///
/// Built fluently and frozen once registered into a pipeline graph.
///
/// ```rust,ignore
/// let train = StepDescriptor::new("train", TrainStep::default())
///     .with_inputs(["features"])
///     .with_outputs(["model"])
///     .with_retry(RetryPolicy::attempts(3))
///     .with_group("gpu");
/// ```
#[derive(Clone)]
pub struct StepDescriptor {
    name: String,
    logic: Arc<dyn StepLogic>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    fingerprint: Option<String>,
    cache_strategy: CacheStrategy,
    cache_ttl: Option<Duration>,
    retry: RetryPolicy,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    fallback: Option<Arc<dyn StepLogic>>,
    group: Option<String>,
    resources: Option<ResourceRequirement>,
    skip_if: Option<Arc<dyn Condition>>,
    params: Vec<String>,
    accepts_absent_inputs: bool,
}

impl StepDescriptor {
    /// Creates a descriptor with no inputs or outputs.
    pub fn new(name: impl Into<String>, logic: impl StepLogic + 'static) -> Self {
        Self::from_arc(name, Arc::new(logic))
    }

    /// Creates a descriptor from shared logic.
    pub fn from_arc(name: impl Into<String>, logic: Arc<dyn StepLogic>) -> Self {
        Self {
            name: name.into(),
            logic,
            inputs: Vec::new(),
            outputs: Vec::new(),
            fingerprint: None,
            cache_strategy: CacheStrategy::default(),
            cache_ttl: None,
            retry: RetryPolicy::default(),
            circuit_breaker: None,
            fallback: None,
            group: None,
            resources: None,
            skip_if: None,
            params: Vec::new(),
            accepts_absent_inputs: false,
        }
    }

    /// Sets the ordered input names.
    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the ordered output names.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the content fingerprint explicitly.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Derives the fingerprint from the logic's source text.
    #[must_use]
    pub fn with_code(mut self, source: &str) -> Self {
        self.fingerprint = Some(sha256_hex(source.as_bytes()));
        self
    }

    /// Sets the cache strategy.
    #[must_use]
    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    /// Sets a time-to-live for this step's cache entries.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Enables a circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    /// Sets the fallback logic.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl StepLogic + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Sets the execution-group label.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the resource requirement.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequirement) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Sets the skip predicate.
    #[must_use]
    pub fn skip_if(mut self, condition: Arc<dyn Condition>) -> Self {
        self.skip_if = Some(condition);
        self
    }

    /// Declares the run parameters the step reads.
    #[must_use]
    pub fn with_params(mut self, params: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Lets the step run with `null` inputs when their producer was skipped.
    #[must_use]
    pub fn accept_absent_inputs(mut self) -> Self {
        self.accepts_absent_inputs = true;
        self
    }

    /// Returns the step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the logic.
    #[must_use]
    pub fn logic(&self) -> &Arc<dyn StepLogic> {
        &self.logic
    }

    /// Returns the input names.
    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Returns the output names.
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Returns the content fingerprint.
    ///
    /// Falls back to the logic's own fingerprint, then to a hash of the
    /// logic's debug representation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.fingerprint
            .clone()
            .or_else(|| self.logic.fingerprint())
            .unwrap_or_else(|| sha256_hex(format!("{:?}", self.logic).as_bytes()))
    }

    /// Returns the cache strategy.
    #[must_use]
    pub fn cache_strategy(&self) -> CacheStrategy {
        self.cache_strategy
    }

    /// Returns the cache TTL.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Returns the circuit breaker policy.
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerPolicy> {
        self.circuit_breaker.as_ref()
    }

    /// Returns the fallback logic.
    #[must_use]
    pub fn fallback(&self) -> Option<&Arc<dyn StepLogic>> {
        self.fallback.as_ref()
    }

    /// Returns the group label.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Returns the resource requirement.
    #[must_use]
    pub fn resources(&self) -> Option<&ResourceRequirement> {
        self.resources.as_ref()
    }

    /// Returns the skip predicate.
    #[must_use]
    pub fn skip_predicate(&self) -> Option<&Arc<dyn Condition>> {
        self.skip_if.as_ref()
    }

    /// Returns the declared parameter names.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Returns true if the step accepts absent inputs.
    #[must_use]
    pub fn accepts_absent_inputs(&self) -> bool {
        self.accepts_absent_inputs
    }

    /// Picks the declared parameters out of the run parameters.
    #[must_use]
    pub fn select_params(
        &self,
        run_params: &std::collections::BTreeMap<String, Value>,
    ) -> std::collections::BTreeMap<String, Value> {
        self.params
            .iter()
            .filter_map(|p| run_params.get(p).map(|v| (p.clone(), v.clone())))
            .collect()
    }

    /// Validates the descriptor on its own.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        if self.name.trim().is_empty() {
            return Err(GraphValidationError::EmptyStepName);
        }
        if let Some(input) = self.inputs.iter().find(|i| self.outputs.contains(i)) {
            tracing::debug!(step = %self.name, input = %input, "Step consumes its own output");
            return Err(GraphValidationError::Cycle {
                path: vec![self.name.clone(), self.name.clone()],
            });
        }
        Ok(())
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("logic", &self.logic)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("cache_strategy", &self.cache_strategy)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("has_fallback", &self.fallback.is_some())
            .field("group", &self.group)
            .field("has_skip_if", &self.skip_if.is_some())
            .field("params", &self.params)
            .field("accepts_absent_inputs", &self.accepts_absent_inputs)
            .finish_non_exhaustive()
    }
}
