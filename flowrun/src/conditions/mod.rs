//! Conditional control flow: skip predicates and `If` branches.
//!
//! Before a step is invoked the scheduler asks the [`ConditionEvaluator`]
//! whether it runs. The evaluator applies, in order:
//!
//! 1. `If` branches naming the step as a target (predicate evaluated once per run)
//! 2. the step's own skip predicate
//! 3. skip propagation: a step fed by a skipped producer is skipped too, unless
//!    it accepts absent inputs, in which case those inputs arrive as `null`

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::pipeline::{InputSource, PipelineGraph};

/// Immutable view of a run's state handed to predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    /// Values produced so far (and external inputs) by output name.
    pub outputs: BTreeMap<String, Value>,
    /// Run parameters.
    pub params: BTreeMap<String, Value>,
    /// Steps skipped so far.
    pub skipped: BTreeSet<String>,
}

impl RunSnapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(outputs: BTreeMap<String, Value>, params: BTreeMap<String, Value>) -> Self {
        Self {
            outputs,
            params,
            skipped: BTreeSet::new(),
        }
    }

    /// Returns an output value.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Returns true if the step was skipped.
    #[must_use]
    pub fn is_skipped(&self, step: &str) -> bool {
        self.skipped.contains(step)
    }
}

/// A boolean predicate over a run snapshot.
#[cfg_attr(test, mockall::automock)]
pub trait Condition: Send + Sync {
    /// Evaluates the predicate.
    fn evaluate(&self, snapshot: &RunSnapshot) -> bool;

    /// Short description used in skip reasons.
    fn describe(&self) -> String {
        "condition".to_string()
    }
}

/// A [`Condition`] backed by a closure.
pub struct FnCondition<F> {
    description: String,
    func: F,
}

impl<F> fmt::Debug for FnCondition<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCondition")
            .field("description", &self.description)
            .finish()
    }
}

impl<F> Condition for FnCondition<F>
where
    F: Fn(&RunSnapshot) -> bool + Send + Sync,
{
    fn evaluate(&self, snapshot: &RunSnapshot) -> bool {
        (self.func)(snapshot)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Wraps a closure as a shareable condition.
pub fn condition_fn<F>(description: impl Into<String>, func: F) -> Arc<dyn Condition>
where
    F: Fn(&RunSnapshot) -> bool + Send + Sync + 'static,
{
    Arc::new(FnCondition {
        description: description.into(),
        func,
    })
}

/// A condition that always returns the same value.
#[must_use]
pub fn always(value: bool) -> Arc<dyn Condition> {
    condition_fn(format!("always {value}"), move |_| value)
}

/// Two-way branch: exactly one of `then_step` / `else_step` runs.
#[derive(Clone)]
pub struct If {
    /// Branch name.
    pub name: String,
    /// Predicate selecting `then_step` when true.
    pub predicate: Arc<dyn Condition>,
    /// Step run when the predicate holds.
    pub then_step: String,
    /// Step run otherwise.
    pub else_step: String,
}

impl If {
    /// Creates a branch with no targets yet.
    #[must_use]
    pub fn new(name: impl Into<String>, predicate: Arc<dyn Condition>) -> Self {
        Self {
            name: name.into(),
            predicate,
            then_step: String::new(),
            else_step: String::new(),
        }
    }

    /// Sets the step run when the predicate holds.
    #[must_use]
    pub fn then_step(mut self, step: impl Into<String>) -> Self {
        self.then_step = step.into();
        self
    }

    /// Sets the step run when the predicate does not hold.
    #[must_use]
    pub fn else_step(mut self, step: impl Into<String>) -> Self {
        self.else_step = step.into();
        self
    }

    /// Returns true if `step` is one of the targets.
    #[must_use]
    pub fn targets(&self, step: &str) -> bool {
        self.then_step == step || self.else_step == step
    }
}

impl fmt::Debug for If {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("If")
            .field("name", &self.name)
            .field("predicate", &self.predicate.describe())
            .field("then_step", &self.then_step)
            .field("else_step", &self.else_step)
            .finish()
    }
}

/// Whether a step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run the step. `absent_inputs` lists inputs whose producer was skipped.
    Run {
        /// Inputs to pass as `null`.
        absent_inputs: Vec<String>,
    },
    /// Skip the step.
    Skip {
        /// Why.
        reason: String,
    },
}

impl Decision {
    /// Returns true for [`Decision::Skip`].
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}

/// Per-run condition evaluator.
///
/// Branch predicates are memoized, so every target of one branch sees the
/// same selection even if the snapshot changed in between.
pub struct ConditionEvaluator {
    graph: PipelineGraph,
    branch_choices: Mutex<HashMap<String, bool>>,
}

impl fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionEvaluator")
            .field("pipeline", &self.graph.name())
            .field("branch_choices", &*self.branch_choices.lock())
            .finish()
    }
}

impl ConditionEvaluator {
    /// Creates an evaluator for one run of `graph`.
    #[must_use]
    pub fn new(graph: PipelineGraph) -> Self {
        Self {
            graph,
            branch_choices: Mutex::new(HashMap::new()),
        }
    }

    fn branch_selects(&self, branch: &If, snapshot: &RunSnapshot) -> bool {
        let mut choices = self.branch_choices.lock();
        *choices.entry(branch.name.clone()).or_insert_with(|| {
            let selected = branch.predicate.evaluate(snapshot);
            debug!(branch = %branch.name, selected, "Branch predicate evaluated");
            selected
        })
    }

    /// Decides whether the step at `index` runs.
    #[must_use]
    pub fn evaluate_step(&self, index: usize, snapshot: &RunSnapshot) -> Decision {
        let node = self.graph.node(index);
        let step = node.descriptor.name();

        for branch in self.graph.branches().iter().filter(|b| b.targets(step)) {
            let take_then = self.branch_selects(branch, snapshot);
            let selected = if take_then {
                &branch.then_step
            } else {
                &branch.else_step
            };
            if selected != step {
                return Decision::Skip {
                    reason: format!("branch '{}' selected '{selected}'", branch.name),
                };
            }
        }

        if let Some(predicate) = node.descriptor.skip_predicate() {
            if predicate.evaluate(snapshot) {
                return Decision::Skip {
                    reason: format!("skip_if: {}", predicate.describe()),
                };
            }
        }

        let mut absent_inputs = Vec::new();
        for (input, source) in &node.input_sources {
            if let InputSource::Step(producer) = source {
                let producer_name = self.graph.node(*producer).descriptor.name();
                if snapshot.is_skipped(producer_name) {
                    if !node.descriptor.accepts_absent_inputs() {
                        return Decision::Skip {
                            reason: format!("upstream step '{producer_name}' was skipped"),
                        };
                    }
                    absent_inputs.push(input.clone());
                }
            }
        }

        Decision::Run { absent_inputs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineBuilder, StepDescriptor};
    use crate::testing::ConstStep;
    use serde_json::json;

    fn graph(branch: Option<If>, c_accepts_absent: bool, b_skip: bool) -> PipelineGraph {
        let mut c = StepDescriptor::new("c", ConstStep::single("z", json!(3))).with_inputs(["y"]);
        if c_accepts_absent {
            c = c.accept_absent_inputs();
        }
        let mut b = StepDescriptor::new("b", ConstStep::single("y", json!(2)));
        if b_skip {
            b = b.skip_if(always(true));
        }
        let mut builder = PipelineBuilder::new("cond")
            .step(StepDescriptor::new("a", ConstStep::single("x", json!(1))))
            .step(b)
            .step(c);
        if let Some(branch) = branch {
            builder = builder.branch(branch);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_skip_predicate() {
        let g = graph(None, false, true);
        let evaluator = ConditionEvaluator::new(g.clone());
        let snapshot = RunSnapshot::default();

        assert_eq!(
            evaluator.evaluate_step(g.index_of("a").unwrap(), &snapshot),
            Decision::Run { absent_inputs: vec![] }
        );
        assert!(evaluator
            .evaluate_step(g.index_of("b").unwrap(), &snapshot)
            .is_skip());
    }

    #[test]
    fn test_skip_propagates_to_consumer() {
        let g = graph(None, false, true);
        let evaluator = ConditionEvaluator::new(g.clone());
        let mut snapshot = RunSnapshot::default();
        snapshot.skipped.insert("b".into());

        match evaluator.evaluate_step(g.index_of("c").unwrap(), &snapshot) {
            Decision::Skip { reason } => assert!(reason.contains("'b'")),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn test_absent_inputs_opt_in() {
        let g = graph(None, true, true);
        let evaluator = ConditionEvaluator::new(g.clone());
        let mut snapshot = RunSnapshot::default();
        snapshot.skipped.insert("b".into());

        assert_eq!(
            evaluator.evaluate_step(g.index_of("c").unwrap(), &snapshot),
            Decision::Run {
                absent_inputs: vec!["y".to_string()]
            }
        );
    }

    #[test]
    fn test_branch_evaluated_once() {
        let mut mock = MockCondition::new();
        mock.expect_evaluate().times(1).return_const(false);
        mock.expect_describe().return_const("flag".to_string());
        let branch = If::new("route", Arc::new(mock)).then_step("a").else_step("b");

        let g = graph(Some(branch), false, false);
        let evaluator = ConditionEvaluator::new(g.clone());
        let snapshot = RunSnapshot::default();

        assert!(evaluator
            .evaluate_step(g.index_of("a").unwrap(), &snapshot)
            .is_skip());
        assert!(!evaluator
            .evaluate_step(g.index_of("b").unwrap(), &snapshot)
            .is_skip());
    }

    #[test]
    fn test_condition_fn_reads_snapshot() {
        let cond = condition_fn("big input", |s: &RunSnapshot| {
            s.output("rows").and_then(Value::as_i64).unwrap_or(0) > 100
        });
        let mut snapshot = RunSnapshot::default();
        snapshot.outputs.insert("rows".into(), json!(500));

        assert!(cond.evaluate(&snapshot));
        assert_eq!(cond.describe(), "big input");
        assert!(!cond.evaluate(&RunSnapshot::default()));
    }
}
