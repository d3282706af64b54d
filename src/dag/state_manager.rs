// src/dag/state_manager.rs

//! Read-only readiness and blocking analysis over one plan's tasks.

use std::collections::HashMap;

use tracing::warn;

use crate::dag::graph::DagGraph;
use crate::dag::model::{PlanStatus, PlanSummary, Task, TaskStatus};
use crate::types::TaskId;

/// How a task's dependencies currently look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// Every dependency is done (or skipped and tolerated).
    Satisfied,
    /// Some dependency is still pending / running / retrying.
    Waiting,
    /// This dependency can no longer satisfy the task.
    Fatal(TaskId),
}

/// A read-only view of a plan for dependency questions.
///
/// The store builds one of these while holding its lock; nothing here
/// mutates.
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    tasks: &'a HashMap<TaskId, Task>,
    topo_rank: &'a HashMap<TaskId, usize>,
}

impl<'a> StateManager<'a> {
    pub fn new(
        graph: &'a DagGraph,
        tasks: &'a HashMap<TaskId, Task>,
        topo_rank: &'a HashMap<TaskId, usize>,
    ) -> Self {
        Self {
            graph,
            tasks,
            topo_rank,
        }
    }

    /// This is the canonical implementation of dependency satisfaction logic.
    ///
    /// A fatal dependency wins over a waiting one: a task with one failed
    /// and one running dependency is already doomed.
    pub fn dependency_state(&self, task: &Task) -> DependencyState {
        let mut waiting = false;

        for dep_id in self.graph.dependencies_of(&task.id) {
            let Some(dep) = self.tasks.get(dep_id) else {
                warn!(
                    task = %task.id,
                    dep = %dep_id,
                    "dependency missing from tasks map"
                );
                return DependencyState::Fatal(*dep_id);
            };

            match dep.status {
                TaskStatus::Done => {}
                TaskStatus::Skipped if task.tolerate_skipped => {}
                TaskStatus::Skipped | TaskStatus::Failed | TaskStatus::Blocked => {
                    return DependencyState::Fatal(*dep_id);
                }
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Retrying => {
                    waiting = true;
                }
            }
        }

        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Satisfied
        }
    }

    pub fn deps_satisfied(&self, task: &Task) -> bool {
        self.dependency_state(task) == DependencyState::Satisfied
    }

    /// Pending tasks whose dependencies are satisfied, in `order`.
    pub fn ready_tasks(&self, order: &[TaskId]) -> Vec<&'a Task> {
        order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending && self.deps_satisfied(t))
            .collect()
    }

    /// Transitive dependents of `root`, dependencies before dependents.
    ///
    /// Walking in topological order lets callers re-evaluate each task after
    /// all of its parents have been updated.
    pub fn descendants_in_topo_order(&self, root: &TaskId) -> Vec<TaskId> {
        let mut desc = self.graph.descendants_of(root);
        desc.sort_by_key(|id| self.topo_rank.get(id).copied().unwrap_or(usize::MAX));
        desc
    }

    /// Whether any task still keeps an execution of this plan alive.
    pub fn any_active(&self) -> bool {
        self.tasks.values().any(|t| t.status.is_active())
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for task in self.tasks.values() {
            summary.count(task.status);
        }
        summary
    }

    /// Outcome of a settled plan: failed if any *required* task failed or
    /// was blocked, done otherwise.
    pub fn settled_status(&self) -> PlanStatus {
        let required_lost = self.tasks.values().any(|t| {
            t.required && matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked)
        });

        if required_lost {
            PlanStatus::Failed
        } else {
            PlanStatus::Done
        }
    }
}
