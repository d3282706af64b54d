// src/dag/graph.rs

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::model::TaskSpec;
use crate::errors::{Result, RunweaveError};
use crate::types::TaskId;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct dependencies: tasks that must be done before this one can run.
    deps: Vec<TaskId>,
    /// Direct dependents: tasks that depend on this one.
    dependents: Vec<TaskId>,
}

/// In-memory adjacency of one plan's tasks.
///
/// Acyclicity is checked once by [`validate_specs`] before a plan is
/// stored, so here we just keep adjacency information for scheduling and
/// blocking propagation.
#[derive(Debug, Clone, Default)]
pub struct DagGraph {
    nodes: HashMap<TaskId, DagNode>,
}

impl DagGraph {
    /// Build from `(task, dependencies)` pairs.
    ///
    /// Assumes all referenced ids are part of the iterator.
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (TaskId, &'a [TaskId])>) -> Self {
        let mut nodes: HashMap<TaskId, DagNode> = HashMap::new();

        for (id, deps) in edges {
            nodes.entry(id).or_default().deps = deps.to_vec();
        }

        let ids: Vec<TaskId> = nodes.keys().copied().collect();
        for id in ids {
            let deps = nodes.get(&id).map(|n| n.deps.clone()).unwrap_or_default();
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(id);
                }
            }
        }

        Self { nodes }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskId> {
        self.nodes.keys()
    }

    pub fn dependencies_of(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// All transitive dependents of `root` in breadth-first order, excluding
    /// `root` itself. Every id appears once.
    pub fn descendants_of(&self, root: &TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents_of(root).iter().copied().collect();
        let mut out = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            queue.extend(self.dependents_of(&id).iter().copied());
        }

        out
    }
}

/// Validate that `specs` form a DAG and return spec indices in topological
/// order (dependencies first).
///
/// Rejects empty plans, duplicate keys, self-dependencies, dependencies on
/// unknown keys and cycles, all as [`RunweaveError::InvalidGraph`].
pub fn validate_specs(specs: &[TaskSpec]) -> Result<Vec<usize>> {
    if specs.is_empty() {
        return Err(RunweaveError::InvalidGraph(
            "a plan must contain at least one task".to_string(),
        ));
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.key.as_str(), i).is_some() {
            return Err(RunweaveError::InvalidGraph(format!(
                "duplicate task key '{}'",
                spec.key
            )));
        }
    }

    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..specs.len() {
        graph.add_node(i);
    }

    for (i, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            if dep == &spec.key {
                return Err(RunweaveError::InvalidGraph(format!(
                    "task '{}' cannot depend on itself",
                    spec.key
                )));
            }
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                return Err(RunweaveError::InvalidGraph(format!(
                    "task '{}' has unknown dependency '{}'",
                    spec.key, dep
                )));
            };
            graph.add_edge(dep_idx, i, ());
        }
    }

    // A topological sort will fail if there is a cycle.
    toposort(&graph, None).map_err(|cycle| {
        RunweaveError::InvalidGraph(format!(
            "cycle detected in task graph involving task '{}'",
            specs[cycle.node_id()].key
        ))
    })
}
