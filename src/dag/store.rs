// src/dag/store.rs

//! Task graph store: plans, tasks and their edges.
//!
//! [`TaskGraphStore::mark`] is the single mutation entry point for task
//! status. Plan creation is atomic: either every task is inserted or, on a
//! validation failure, nothing is.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dag::graph::{DagGraph, validate_specs};
use crate::dag::model::{
    Plan, PlanStatus, PlanSummary, Task, TaskError, TaskErrorKind, TaskMark, TaskSpec, TaskStatus,
};
use crate::dag::state_manager::{DependencyState, StateManager};
use crate::errors::{Result, RunweaveError};
use crate::types::{PlanId, TaskId};

/// Result of a [`TaskGraphStore::mark`] call.
#[derive(Debug, Clone)]
pub enum MarkOutcome {
    /// The status changed; `task` is the updated record.
    Applied { previous: TaskStatus, task: Task },
    /// The task already had the requested status; nothing was written.
    Unchanged(Task),
}

impl MarkOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MarkOutcome::Applied { .. })
    }

    pub fn task(&self) -> &Task {
        match self {
            MarkOutcome::Applied { task, .. } | MarkOutcome::Unchanged(task) => task,
        }
    }
}

#[derive(Debug)]
struct PlanRecord {
    plan: Plan,
    tasks: HashMap<TaskId, Task>,
    graph: DagGraph,
    topo_rank: HashMap<TaskId, usize>,
}

impl PlanRecord {
    fn view(&self) -> StateManager<'_> {
        StateManager::new(&self.graph, &self.tasks, &self.topo_rank)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    plans: HashMap<PlanId, PlanRecord>,
    task_index: HashMap<TaskId, PlanId>,
}

impl StoreInner {
    fn record(&self, plan_id: &PlanId) -> Result<&PlanRecord> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| RunweaveError::PlanNotFound(plan_id.to_string()))
    }

    fn record_of_task(&self, task_id: &TaskId) -> Result<&PlanRecord> {
        let plan_id = self
            .task_index
            .get(task_id)
            .ok_or_else(|| RunweaveError::TaskNotFound(task_id.to_string()))?;
        self.record(plan_id)
    }
}

/// In-memory task graph store shared by the scheduler, run drivers and the
/// control API.
#[derive(Debug, Default)]
pub struct TaskGraphStore {
    inner: RwLock<StoreInner>,
}

impl TaskGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `specs` as a DAG and persist the plan with all its tasks.
    ///
    /// `default_max_retries` applies to specs without their own budget.
    pub fn create_plan(
        &self,
        session_id: &str,
        goal: &str,
        specs: Vec<TaskSpec>,
        default_max_retries: u32,
    ) -> Result<Plan> {
        let order = validate_specs(&specs)?;

        let now = Utc::now();
        let plan_id: PlanId = Uuid::new_v4();
        let ids: HashMap<&str, TaskId> = specs
            .iter()
            .map(|s| (s.key.as_str(), Uuid::new_v4()))
            .collect();

        let mut tasks = HashMap::with_capacity(specs.len());
        let mut task_ids = Vec::with_capacity(specs.len());

        for spec in &specs {
            let id = ids[spec.key.as_str()];
            let depends_on = spec
                .depends_on
                .iter()
                .map(|k| ids[k.as_str()])
                .collect();

            task_ids.push(id);
            tasks.insert(
                id,
                Task {
                    id,
                    plan_id,
                    key: spec.key.clone(),
                    title: spec.title.clone(),
                    description: spec.description.clone(),
                    depends_on,
                    can_parallel: spec.can_parallel,
                    required: spec.required,
                    tolerate_skipped: spec.tolerate_skipped,
                    status: TaskStatus::Pending,
                    retry_count: 0,
                    max_retries: spec.max_retries.unwrap_or(default_max_retries),
                    metadata: spec.metadata.clone(),
                    result: None,
                    error: None,
                    started_at: None,
                    completed_at: None,
                },
            );
        }

        let edges: Vec<(TaskId, Vec<TaskId>)> = tasks
            .values()
            .map(|t| (t.id, t.depends_on.iter().copied().collect()))
            .collect();
        let graph = DagGraph::from_edges(edges.iter().map(|(id, deps)| (*id, deps.as_slice())));

        let topo_rank = order
            .iter()
            .enumerate()
            .map(|(rank, &spec_idx)| (ids[specs[spec_idx].key.as_str()], rank))
            .collect();

        let plan = Plan {
            id: plan_id,
            session_id: session_id.to_string(),
            goal: goal.to_string(),
            status: PlanStatus::Pending,
            task_ids,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.write();
        for id in tasks.keys() {
            inner.task_index.insert(*id, plan_id);
        }
        inner.plans.insert(
            plan_id,
            PlanRecord {
                plan: plan.clone(),
                tasks,
                graph,
                topo_rank,
            },
        );

        info!(plan = %plan_id, session = %session_id, tasks = plan.task_ids.len(), "plan created");
        Ok(plan)
    }

    pub fn get_plan(&self, plan_id: &PlanId) -> Result<Plan> {
        Ok(self.read().record(plan_id)?.plan.clone())
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        let inner = self.read();
        let record = inner.record_of_task(task_id)?;
        record
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| RunweaveError::TaskNotFound(task_id.to_string()))
    }

    /// All tasks of a plan in creation order.
    pub fn tasks_of(&self, plan_id: &PlanId) -> Result<Vec<Task>> {
        let inner = self.read();
        let record = inner.record(plan_id)?;
        Ok(record
            .plan
            .task_ids
            .iter()
            .filter_map(|id| record.tasks.get(id).cloned())
            .collect())
    }

    pub fn task_by_key(&self, plan_id: &PlanId, key: &str) -> Result<Task> {
        let inner = self.read();
        let record = inner.record(plan_id)?;
        record
            .tasks
            .values()
            .find(|t| t.key == key)
            .cloned()
            .ok_or_else(|| RunweaveError::TaskNotFound(format!("{plan_id}/{key}")))
    }

    /// Pending tasks whose dependencies are satisfied, in plan order.
    pub fn get_ready_tasks(&self, plan_id: &PlanId) -> Result<Vec<Task>> {
        let inner = self.read();
        let record = inner.record(plan_id)?;
        Ok(record
            .view()
            .ready_tasks(&record.plan.task_ids)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn dependency_state(&self, task_id: &TaskId) -> Result<DependencyState> {
        let inner = self.read();
        let record = inner.record_of_task(task_id)?;
        let task = record
            .tasks
            .get(task_id)
            .ok_or_else(|| RunweaveError::TaskNotFound(task_id.to_string()))?;
        Ok(record.view().dependency_state(task))
    }

    /// Transitive dependents of `task_id`, dependencies first.
    pub fn descendants(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let inner = self.read();
        let record = inner.record_of_task(task_id)?;
        Ok(record.view().descendants_in_topo_order(task_id))
    }

    /// Results of the `done` dependencies of a task, keyed by dependency key.
    pub fn inputs_for(&self, task_id: &TaskId) -> Result<BTreeMap<String, Value>> {
        let inner = self.read();
        let record = inner.record_of_task(task_id)?;
        let task = record
            .tasks
            .get(task_id)
            .ok_or_else(|| RunweaveError::TaskNotFound(task_id.to_string()))?;

        Ok(task
            .depends_on
            .iter()
            .filter_map(|dep_id| record.tasks.get(dep_id))
            .filter(|dep| dep.status == TaskStatus::Done)
            .map(|dep| (dep.key.clone(), dep.result.clone().unwrap_or(Value::Null)))
            .collect())
    }

    pub fn plan_summary(&self, plan_id: &PlanId) -> Result<PlanSummary> {
        Ok(self.read().record(plan_id)?.view().summary())
    }

    /// Whether any task of the plan is pending, in progress or retrying.
    pub fn any_active(&self, plan_id: &PlanId) -> Result<bool> {
        Ok(self.read().record(plan_id)?.view().any_active())
    }

    /// Done/failed verdict for a plan with no active tasks left.
    pub fn settled_status(&self, plan_id: &PlanId) -> Result<PlanStatus> {
        Ok(self.read().record(plan_id)?.view().settled_status())
    }

    /// Returns `true` if the status changed.
    pub fn set_plan_status(&self, plan_id: &PlanId, status: PlanStatus) -> Result<bool> {
        let mut inner = self.write();
        let record = inner
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| RunweaveError::PlanNotFound(plan_id.to_string()))?;

        if record.plan.status == status {
            return Ok(false);
        }

        debug!(plan = %plan_id, from = %record.plan.status, to = %status, "plan status change");
        record.plan.status = status;
        record.plan.updated_at = Utc::now();
        Ok(true)
    }

    pub fn plans_for_session(&self, session_id: &str) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .read()
            .plans
            .values()
            .filter(|r| r.plan.session_id == session_id)
            .map(|r| r.plan.clone())
            .collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Cascading removal of every plan (and its tasks) owned by a session.
    pub fn delete_session(&self, session_id: &str) -> usize {
        let mut inner = self.write();
        let doomed: Vec<PlanId> = inner
            .plans
            .values()
            .filter(|r| r.plan.session_id == session_id)
            .map(|r| r.plan.id)
            .collect();

        for plan_id in &doomed {
            if let Some(record) = inner.plans.remove(plan_id) {
                for task_id in record.tasks.keys() {
                    inner.task_index.remove(task_id);
                }
            }
        }
        doomed.len()
    }

    /// Apply a status change to a task.
    ///
    /// Re-applying the task's current status is a no-op returning
    /// [`MarkOutcome::Unchanged`]. Leaving `in_progress` through a failure
    /// (`retrying` / `failed`) consumes one attempt of the retry budget.
    pub fn mark(&self, task_id: &TaskId, mark: TaskMark) -> Result<MarkOutcome> {
        let mut inner = self.write();
        let plan_id = *inner
            .task_index
            .get(task_id)
            .ok_or_else(|| RunweaveError::TaskNotFound(task_id.to_string()))?;
        let record = inner
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| RunweaveError::PlanNotFound(plan_id.to_string()))?;

        let (from, deps_state, blocked_by_key) = {
            let task = record
                .tasks
                .get(task_id)
                .ok_or_else(|| RunweaveError::TaskNotFound(task_id.to_string()))?;
            let view = record.view();
            let blocked_by_key = match &mark {
                TaskMark::Blocked { blocked_by } => record.tasks.get(blocked_by).map(|t| t.key.clone()),
                _ => None,
            };
            (task.status, view.dependency_state(task), blocked_by_key)
        };

        let to = mark.target();
        if from == to {
            let task = record.tasks[task_id].clone();
            return Ok(MarkOutcome::Unchanged(task));
        }

        if !transition_allowed(from, to) {
            return Err(RunweaveError::InvalidTransition {
                task_id: task_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        if to == TaskStatus::InProgress && deps_state != DependencyState::Satisfied {
            return Err(RunweaveError::InvalidTransition {
                task_id: task_id.to_string(),
                from: format!("{from} (dependencies not satisfied)"),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let Some(task) = record.tasks.get_mut(task_id) else {
            return Err(RunweaveError::TaskNotFound(task_id.to_string()));
        };

        let consumes_attempt = from == TaskStatus::InProgress
            && matches!(to, TaskStatus::Retrying | TaskStatus::Failed);
        if consumes_attempt {
            task.retry_count += 1;
        }

        task.status = to;
        match mark {
            TaskMark::Pending => {
                if from == TaskStatus::Failed {
                    task.retry_count = 0;
                }
                if matches!(from, TaskStatus::Failed | TaskStatus::Blocked) {
                    task.error = None;
                    task.completed_at = None;
                }
            }
            TaskMark::InProgress => {
                task.started_at = Some(now);
                task.completed_at = None;
            }
            TaskMark::Done { result } => {
                task.result = Some(result);
                task.error = None;
                task.completed_at = Some(now);
            }
            TaskMark::Retrying { error } => {
                task.error = Some(error);
            }
            TaskMark::Failed { error } => {
                task.error = Some(error);
                task.completed_at = Some(now);
            }
            TaskMark::Blocked { blocked_by } => {
                let by = blocked_by_key.unwrap_or_else(|| blocked_by.to_string());
                task.error = Some(TaskError::new(
                    TaskErrorKind::Dependency,
                    format!("blocked by failed dependency '{by}'"),
                ));
                task.completed_at = Some(now);
            }
            TaskMark::Skipped => {
                task.completed_at = Some(now);
            }
        }

        let updated = task.clone();
        record.plan.updated_at = now;

        debug!(task = %task_id, key = %updated.key, %from, %to, "task status change");
        Ok(MarkOutcome::Applied {
            previous: from,
            task: updated,
        })
    }
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus as S;

    match from {
        S::Pending => matches!(to, S::InProgress | S::Blocked | S::Skipped | S::Failed),
        S::InProgress => matches!(
            to,
            S::Done | S::Retrying | S::Failed | S::Pending | S::Skipped
        ),
        S::Retrying => matches!(to, S::Pending | S::Failed | S::Skipped),
        S::Failed | S::Blocked => matches!(to, S::Pending | S::Skipped),
        S::Done | S::Skipped => false,
    }
}
