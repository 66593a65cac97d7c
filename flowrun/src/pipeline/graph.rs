//! Validated pipeline graph stored as an arena of step nodes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::step::StepDescriptor;
use crate::conditions::If;
use crate::errors::GraphValidationError;

/// Producer name reported for external inputs in duplicate-output errors.
pub const EXTERNAL_PRODUCER: &str = "<external>";

/// Where a step input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// Supplied by the caller at run start.
    External,
    /// Produced by the step at this node index.
    Step(usize),
}

/// One step in the arena with its resolved edges.
#[derive(Debug, Clone)]
pub struct StepNode {
    /// The step declaration.
    pub descriptor: StepDescriptor,
    /// Node indices of producers this step consumes from, ascending.
    pub predecessors: Vec<usize>,
    /// Node indices of consumers of this step's outputs, ascending.
    pub successors: Vec<usize>,
    /// Source of every input, in declared order.
    pub input_sources: Vec<(String, InputSource)>,
}

#[derive(Debug)]
struct GraphInner {
    name: String,
    nodes: Vec<StepNode>,
    index: HashMap<String, usize>,
    external_inputs: BTreeSet<String>,
    producers: HashMap<String, usize>,
    branches: Vec<If>,
    topo_order: Vec<usize>,
}

/// A validated, acyclic pipeline.
///
/// Cloning is cheap; the arena is shared.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    inner: Arc<GraphInner>,
}

impl PipelineGraph {
    pub(crate) fn build(
        name: String,
        steps: Vec<StepDescriptor>,
        external_inputs: BTreeSet<String>,
        branches: Vec<If>,
    ) -> Result<Self, GraphValidationError> {
        if name.trim().is_empty() {
            return Err(GraphValidationError::EmptyName);
        }
        if steps.is_empty() {
            return Err(GraphValidationError::EmptyPipeline(name));
        }

        let mut index = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            step.validate()?;
            if index.insert(step.name().to_string(), i).is_some() {
                return Err(GraphValidationError::DuplicateStep(step.name().to_string()));
            }
        }

        let mut producers: HashMap<String, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            for output in step.outputs() {
                if external_inputs.contains(output) {
                    return Err(GraphValidationError::DuplicateOutput {
                        output: output.clone(),
                        producers: vec![EXTERNAL_PRODUCER.to_string(), step.name().to_string()],
                    });
                }
                if let Some(&first) = producers.get(output) {
                    return Err(GraphValidationError::DuplicateOutput {
                        output: output.clone(),
                        producers: vec![steps[first].name().to_string(), step.name().to_string()],
                    });
                }
                producers.insert(output.clone(), i);
            }
        }

        let mut nodes: Vec<StepNode> = steps
            .into_iter()
            .map(|descriptor| StepNode {
                descriptor,
                predecessors: Vec::new(),
                successors: Vec::new(),
                input_sources: Vec::new(),
            })
            .collect();

        let mut edges = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            let mut preds = BTreeSet::new();
            for input in node.descriptor.inputs() {
                let source = if let Some(&producer) = producers.get(input) {
                    preds.insert(producer);
                    InputSource::Step(producer)
                } else if external_inputs.contains(input) {
                    InputSource::External
                } else {
                    return Err(GraphValidationError::UnresolvedInput {
                        step: node.descriptor.name().to_string(),
                        input: input.clone(),
                    });
                };
                node.input_sources.push((input.clone(), source));
            }
            for &p in &preds {
                edges.push((p, i));
            }
            node.predecessors = preds.into_iter().collect();
        }
        for (from, to) in edges {
            nodes[from].successors.push(to);
        }
        for node in &mut nodes {
            node.successors.sort_unstable();
            node.successors.dedup();
        }

        validate_branches(&branches, &index)?;

        let topo_order = match topological_order(&nodes) {
            Some(order) => order,
            None => {
                let path = find_cycle(&nodes).unwrap_or_default();
                return Err(GraphValidationError::Cycle { path });
            }
        };

        Ok(Self {
            inner: Arc::new(GraphInner {
                name,
                nodes,
                index,
                external_inputs,
                producers,
                branches,
                topo_order,
            }),
        })
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Always false; empty pipelines are rejected at build time.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// Returns all nodes in registration order.
    #[must_use]
    pub fn nodes(&self) -> &[StepNode] {
        &self.inner.nodes
    }

    /// Returns the node at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn node(&self, index: usize) -> &StepNode {
        &self.inner.nodes[index]
    }

    /// Returns the node index of a step.
    #[must_use]
    pub fn index_of(&self, step: &str) -> Option<usize> {
        self.inner.index.get(step).copied()
    }

    /// Returns the descriptor of a step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.index_of(name).map(|i| &self.inner.nodes[i].descriptor)
    }

    /// Returns the declared external input names.
    #[must_use]
    pub fn external_inputs(&self) -> &BTreeSet<String> {
        &self.inner.external_inputs
    }

    /// Returns the node index producing `output`.
    #[must_use]
    pub fn producer_of(&self, output: &str) -> Option<usize> {
        self.inner.producers.get(output).copied()
    }

    /// Returns the branch declarations.
    #[must_use]
    pub fn branches(&self) -> &[If] {
        &self.inner.branches
    }

    /// Returns node indices in deterministic topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.inner.topo_order
    }

    /// Returns step names in topological order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.inner
            .topo_order
            .iter()
            .map(|&i| self.inner.nodes[i].descriptor.name())
            .collect()
    }

    /// Returns every node reachable from `index` through successor edges, ascending.
    #[must_use]
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &succ in &self.inner.nodes[current].successors {
                if seen.insert(succ) {
                    stack.push(succ);
                }
            }
        }
        seen.into_iter().collect()
    }
}

fn validate_branches(
    branches: &[If],
    index: &HashMap<String, usize>,
) -> Result<(), GraphValidationError> {
    let mut names: HashSet<&str> = HashSet::new();
    let mut targeted: HashMap<&str, &str> = HashMap::new();
    for branch in branches {
        let invalid = |reason: String| GraphValidationError::InvalidBranch {
            name: branch.name.clone(),
            reason,
        };
        if !names.insert(branch.name.as_str()) {
            return Err(invalid("branch names must be unique".into()));
        }
        for target in [&branch.then_step, &branch.else_step] {
            if target.is_empty() {
                return Err(invalid("both then and else steps are required".into()));
            }
            if !index.contains_key(target.as_str()) {
                return Err(invalid(format!("unknown step '{target}'")));
            }
            if let Some(other) = targeted.insert(target.as_str(), branch.name.as_str()) {
                return Err(invalid(format!(
                    "step '{target}' is already targeted by branch '{other}'"
                )));
            }
        }
        if branch.then_step == branch.else_step {
            return Err(invalid("then and else must be different steps".into()));
        }
    }
    Ok(())
}

/// Kahn's algorithm; ties are broken by registration order.
fn topological_order(nodes: &[StepNode]) -> Option<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.predecessors.len()).collect();
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(current) = ready.pop_first() {
        order.push(current);
        for &succ in &nodes[current].successors {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    (order.len() == nodes.len()).then_some(order)
}

fn find_cycle(nodes: &[StepNode]) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for start in 0..nodes.len() {
        if !visited.contains(&start) {
            if let Some(cycle) = dfs_cycle(nodes, start, &mut visited, &mut on_stack, &mut path) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|i| nodes[i].descriptor.name().to_string())
                        .collect(),
                );
            }
        }
    }
    None
}

fn dfs_cycle(
    nodes: &[StepNode],
    node: usize,
    visited: &mut HashSet<usize>,
    on_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for &succ in &nodes[node].successors {
        if !visited.contains(&succ) {
            if let Some(cycle) = dfs_cycle(nodes, succ, visited, on_stack, path) {
                return Some(cycle);
            }
        } else if on_stack.contains(&succ) {
            let start = path.iter().position(|&n| n == succ).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(succ);
            return Some(cycle);
        }
    }

    path.pop();
    on_stack.remove(&node);
    None
}
