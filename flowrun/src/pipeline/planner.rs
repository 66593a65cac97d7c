//! Execution planning: groups consecutive same-group steps into units.

use serde::Serialize;
use std::collections::BTreeSet;

use super::PipelineGraph;
use crate::core::ResourceRequirement;

/// Steps scheduled and resourced as one block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUnit {
    /// Position of the unit in the plan.
    pub index: usize,
    /// Shared group label; `None` for singleton units of ungrouped steps.
    pub group: Option<String>,
    /// Member node indices, in execution order.
    pub steps: Vec<usize>,
    /// Member step names, in execution order.
    pub step_names: Vec<String>,
    /// Aggregated resource requirement of the members.
    pub resources: ResourceRequirement,
    /// Indices of units this unit depends on, ascending.
    pub predecessors: Vec<usize>,
    /// Indices of units depending on this unit, ascending.
    pub successors: Vec<usize>,
}

impl ExecutionUnit {
    /// Returns the number of member steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Units are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Ordered list of execution units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    units: Vec<ExecutionUnit>,
    unit_of_step: Vec<usize>,
}

impl ExecutionPlan {
    /// Returns the units in plan order.
    #[must_use]
    pub fn units(&self) -> &[ExecutionUnit] {
        &self.units
    }

    /// Returns the unit index of a node.
    #[must_use]
    pub fn unit_of(&self, step_index: usize) -> usize {
        self.unit_of_step[step_index]
    }

    /// Returns the number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if the plan has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Plans the execution units of a graph.
///
/// Walks the graph topologically, taking ready steps in registration order
/// except that a ready step continuing the current group from the current
/// unit's last step is taken first. A step joins the current unit only if it
/// carries the same group label and the unit's last step is one of its
/// direct predecessors.
#[must_use]
pub fn plan(graph: &PipelineGraph) -> ExecutionPlan {
    let nodes = graph.nodes();
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.predecessors.len()).collect();
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();

    let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();

    while !ready.is_empty() {
        let continuation = groups.last().and_then(|(group, members)| {
            let group = group.as_deref()?;
            let last = *members.last()?;
            ready.iter().copied().find(|&candidate| {
                nodes[candidate].descriptor.group() == Some(group)
                    && nodes[candidate].predecessors.contains(&last)
            })
        });

        let next = match continuation {
            Some(step) => {
                ready.remove(&step);
                if let Some((_, members)) = groups.last_mut() {
                    members.push(step);
                }
                step
            }
            None => {
                let Some(step) = ready.pop_first() else { break };
                groups.push((nodes[step].descriptor.group().map(str::to_string), vec![step]));
                step
            }
        };

        for &succ in &nodes[next].successors {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    let mut unit_of_step = vec![0; nodes.len()];
    for (unit_index, (_, members)) in groups.iter().enumerate() {
        for &step in members {
            unit_of_step[step] = unit_index;
        }
    }

    let mut units: Vec<ExecutionUnit> = groups
        .into_iter()
        .enumerate()
        .map(|(index, (group, steps))| {
            let mut predecessors = BTreeSet::new();
            for &step in &steps {
                for &pred in &nodes[step].predecessors {
                    if unit_of_step[pred] != index {
                        predecessors.insert(unit_of_step[pred]);
                    }
                }
            }
            ExecutionUnit {
                index,
                group,
                step_names: steps
                    .iter()
                    .map(|&s| nodes[s].descriptor.name().to_string())
                    .collect(),
                resources: ResourceRequirement::aggregate(
                    steps.iter().filter_map(|&s| nodes[s].descriptor.resources()),
                ),
                steps,
                predecessors: predecessors.into_iter().collect(),
                successors: Vec::new(),
            }
        })
        .collect();

    let edges: Vec<(usize, usize)> = units
        .iter()
        .flat_map(|u| u.predecessors.iter().map(move |&p| (p, u.index)))
        .collect();
    for (from, to) in edges {
        units[from].successors.push(to);
    }

    ExecutionPlan {
        units,
        unit_of_step,
    }
}
