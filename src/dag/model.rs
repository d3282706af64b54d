// src/dag/model.rs

//! Plan and Task records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{PlanId, SessionId, TaskId};

/// Lifecycle of a plan as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Aborted,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Done | PlanStatus::Failed | PlanStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Done => "done",
            PlanStatus::Failed => "failed",
            PlanStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or for a free worker.
    Pending,
    /// Dispatched to a worker.
    InProgress,
    Done,
    /// Retries exhausted, non-retryable failure, or aborted.
    Failed,
    /// An upstream dependency failed (or was skipped and not tolerated).
    Blocked,
    Skipped,
    /// Failed an attempt and waits for its backoff delay to elapse.
    Retrying,
}

impl TaskStatus {
    /// Statuses that need an external decision (or nothing) to change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Skipped
        )
    }

    /// Statuses that keep a plan execution alive.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Retrying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure class of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Network / model hiccups; retried with backoff.
    Transient,
    /// Business failure; never retried.
    Logic,
    /// Caused by an upstream failure; the task is blocked, not failed.
    Dependency,
    /// Vetoed by a tool policy hook; never retried.
    Policy,
    /// Exceeded the task timeout; retried like a transient failure.
    Timeout,
    Aborted,
}

impl TaskErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, TaskErrorKind::Transient | TaskErrorKind::Timeout)
    }
}

/// Structured failure payload stored on a task and carried by events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    /// Collaborator-owned detail (e.g. raw model response).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Transient, message)
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Logic, message)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Policy, message)
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Caller-facing description of a task, before ids are assigned.
///
/// `depends_on` refers to other specs of the same plan by `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_true")]
    pub can_parallel: bool,
    /// A failed or blocked required task fails the plan.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Treat `skipped` dependencies as satisfied.
    #[serde(default)]
    pub tolerate_skipped: bool,
    /// `None` uses the scheduler default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Opaque collaborator data (prompt parameters, shell command, ...).
    #[serde(default)]
    pub metadata: Value,
}

fn default_true() -> bool {
    true
}

impl TaskSpec {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            title: key.clone(),
            key,
            description: String::new(),
            depends_on: Vec::new(),
            can_parallel: true,
            required: true,
            tolerate_skipped: false,
            max_retries: None,
            metadata: Value::Null,
        }
    }
}

/// A task as stored in the task graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub plan_id: PlanId,
    pub key: String,
    pub title: String,
    pub description: String,
    pub depends_on: BTreeSet<TaskId>,
    pub can_parallel: bool,
    pub required: bool,
    pub tolerate_skipped: bool,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: Value,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A plan: a goal decomposed into a DAG of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub session_id: SessionId,
    pub goal: String,
    pub status: PlanStatus,
    /// Task ids in creation order.
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status task counts of one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub retrying: usize,
}

impl PlanSummary {
    pub fn count(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Blocked => self.blocked += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Retrying => self.retrying += 1,
        }
    }
}

/// Requested status change, the argument of `TaskGraphStore::mark`.
#[derive(Debug, Clone)]
pub enum TaskMark {
    /// Back to the ready queue: retry delay elapsed, unblocked, or a
    /// `retry` decision on a failed task.
    Pending,
    InProgress,
    Done { result: Value },
    /// Attempt failed; will be re-admitted after a backoff delay.
    Retrying { error: TaskError },
    Failed { error: TaskError },
    Blocked { blocked_by: TaskId },
    Skipped,
}

impl TaskMark {
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskMark::Pending => TaskStatus::Pending,
            TaskMark::InProgress => TaskStatus::InProgress,
            TaskMark::Done { .. } => TaskStatus::Done,
            TaskMark::Retrying { .. } => TaskStatus::Retrying,
            TaskMark::Failed { .. } => TaskStatus::Failed,
            TaskMark::Blocked { .. } => TaskStatus::Blocked,
            TaskMark::Skipped => TaskStatus::Skipped,
        }
    }
}

/// Description of a task that the scheduler wants a worker to run now.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub task_id: TaskId,
    pub plan_id: PlanId,
    pub key: String,
    pub title: String,
    pub description: String,
    pub metadata: Value,
    /// Zero-based attempt number (equals `retry_count` at dispatch time).
    pub attempt: u32,
    /// Results of the task's `done` dependencies, keyed by dependency key.
    pub inputs: BTreeMap<String, Value>,
    /// Answer supplied when the run resumed after this task asked for input.
    pub answer: Option<Value>,
}
