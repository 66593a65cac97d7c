//! Pipeline builder with validation.

use std::collections::BTreeSet;

use super::{PipelineGraph, StepDescriptor};
use crate::conditions::If;
use crate::errors::GraphValidationError;

/// Collects step declarations and builds a validated [`PipelineGraph`].
///
/// Edges are inferred by matching each declared input name to the step that
/// lists it as an output. Validation happens once, in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    steps: Vec<StepDescriptor>,
    external_inputs: BTreeSet<String>,
    branches: Vec<If>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            external_inputs: BTreeSet::new(),
            branches: Vec::new(),
        }
    }

    /// Declares an input supplied by the caller at run start.
    #[must_use]
    pub fn external_input(mut self, name: impl Into<String>) -> Self {
        self.external_inputs.insert(name.into());
        self
    }

    /// Declares several external inputs.
    #[must_use]
    pub fn external_inputs(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.external_inputs.extend(names.into_iter().map(Into::into));
        self
    }

    /// Registers a step. Registration order breaks ties in the topological order.
    #[must_use]
    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Registers several steps.
    #[must_use]
    pub fn steps(mut self, steps: impl IntoIterator<Item = StepDescriptor>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Adds an `If` branch.
    #[must_use]
    pub fn branch(mut self, branch: If) -> Self {
        self.branches.push(branch);
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of registered steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, a step name is duplicated, an
    /// input has no producer, an output has two producers, a branch is
    /// malformed or the graph has a cycle.
    pub fn build(self) -> Result<PipelineGraph, GraphValidationError> {
        let graph = PipelineGraph::build(self.name, self.steps, self.external_inputs, self.branches)?;
        tracing::debug!(
            pipeline = %graph.name(),
            steps = graph.len(),
            "Pipeline graph built"
        );
        Ok(graph)
    }
}

/// Builds a pipeline from a list of steps and external input names.
pub fn define_pipeline(
    name: impl Into<String>,
    steps: impl IntoIterator<Item = StepDescriptor>,
    external_inputs: impl IntoIterator<Item = impl Into<String>>,
) -> Result<PipelineGraph, GraphValidationError> {
    PipelineBuilder::new(name)
        .external_inputs(external_inputs)
        .steps(steps)
        .build()
}
