// src/events/model.rs

//! Event records and their typed payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{PlanStatus, PlanSummary, TaskError};
use crate::runs::TriggerSource;
use crate::types::{PlanId, RunId, SessionId, TaskId};

/// Which component an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Session,
    Plan,
    Task,
}

/// Follow-up actions a client may offer for a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Retry,
    Skip,
    Modify,
    Abort,
}

impl TaskAction {
    pub const ALL: [TaskAction; 4] = [
        TaskAction::Retry,
        TaskAction::Skip,
        TaskAction::Modify,
        TaskAction::Abort,
    ];
}

/// Event type plus its payload.
///
/// Serialized adjacently tagged, so an [`Event`] reads as
/// `{"type": "task_done", "payload": {...}, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    RunQueued {
        trigger_source: TriggerSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
    },
    RunStarted,
    RunWaitingInput {
        reason: String,
    },
    RunResumed,
    RunCancelRequested,
    RunCancelled,
    RunCompleted {
        output: Value,
    },
    RunFailed {
        error: String,
    },

    ToolCalled {
        tool: String,
        arguments: Value,
    },
    ToolResult {
        tool: String,
        output: Value,
    },
    ToolPolicyBlocked {
        tool: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },

    PlanCreated {
        plan_id: PlanId,
        goal: String,
        task_count: usize,
    },
    PlanStarted {
        plan_id: PlanId,
    },
    PlanCompleted {
        plan_id: PlanId,
        status: PlanStatus,
        summary: PlanSummary,
    },
    PlanAborted {
        plan_id: PlanId,
    },

    TaskStarted {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
        attempt: u32,
    },
    TaskDone {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
        result: Value,
    },
    TaskRetrying {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
        attempt: u32,
        delay_ms: u64,
        error: TaskError,
    },
    TaskFailed {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
        error: TaskError,
        available_actions: Vec<TaskAction>,
    },
    TaskBlocked {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
        blocked_by: TaskId,
    },
    TaskUnblocked {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
    },
    TaskRequeued {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
    },
    TaskSkipped {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
    },
    TaskWaitingInput {
        plan_id: PlanId,
        task_id: TaskId,
        key: String,
        prompt: String,
    },

    /// Collaborator-owned event whose shape the engine does not know.
    Custom {
        name: String,
        source: EventSource,
        data: Value,
    },
}

impl EventKind {
    pub fn source(&self) -> EventSource {
        use EventKind as K;

        match self {
            K::PlanCreated { .. }
            | K::PlanStarted { .. }
            | K::PlanCompleted { .. }
            | K::PlanAborted { .. } => EventSource::Plan,
            K::TaskStarted { .. }
            | K::TaskDone { .. }
            | K::TaskRetrying { .. }
            | K::TaskFailed { .. }
            | K::TaskBlocked { .. }
            | K::TaskUnblocked { .. }
            | K::TaskRequeued { .. }
            | K::TaskSkipped { .. }
            | K::TaskWaitingInput { .. } => EventSource::Task,
            K::ToolPolicyBlocked { task_id: Some(_), .. } => EventSource::Task,
            K::Custom { source, .. } => *source,
            _ => EventSource::Session,
        }
    }

    /// The wire name of the event type (`"task_done"`, ...).
    pub fn type_name(&self) -> &'static str {
        use EventKind as K;

        match self {
            K::RunQueued { .. } => "run_queued",
            K::RunStarted => "run_started",
            K::RunWaitingInput { .. } => "run_waiting_input",
            K::RunResumed => "run_resumed",
            K::RunCancelRequested => "run_cancel_requested",
            K::RunCancelled => "run_cancelled",
            K::RunCompleted { .. } => "run_completed",
            K::RunFailed { .. } => "run_failed",
            K::ToolCalled { .. } => "tool_called",
            K::ToolResult { .. } => "tool_result",
            K::ToolPolicyBlocked { .. } => "tool_policy_blocked",
            K::PlanCreated { .. } => "plan_created",
            K::PlanStarted { .. } => "plan_started",
            K::PlanCompleted { .. } => "plan_completed",
            K::PlanAborted { .. } => "plan_aborted",
            K::TaskStarted { .. } => "task_started",
            K::TaskDone { .. } => "task_done",
            K::TaskRetrying { .. } => "task_retrying",
            K::TaskFailed { .. } => "task_failed",
            K::TaskBlocked { .. } => "task_blocked",
            K::TaskUnblocked { .. } => "task_unblocked",
            K::TaskRequeued { .. } => "task_requeued",
            K::TaskSkipped { .. } => "task_skipped",
            K::TaskWaitingInput { .. } => "task_waiting_input",
            K::Custom { .. } => "custom",
        }
    }

    /// Task the event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        use EventKind as K;

        match self {
            K::TaskStarted { task_id, .. }
            | K::TaskDone { task_id, .. }
            | K::TaskRetrying { task_id, .. }
            | K::TaskFailed { task_id, .. }
            | K::TaskBlocked { task_id, .. }
            | K::TaskUnblocked { task_id, .. }
            | K::TaskRequeued { task_id, .. }
            | K::TaskSkipped { task_id, .. }
            | K::TaskWaitingInput { task_id, .. } => Some(*task_id),
            K::ToolPolicyBlocked { task_id, .. } => *task_id,
            _ => None,
        }
    }
}

/// One entry of a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Process-wide monotonic id.
    pub id: u64,
    pub session_id: SessionId,
    /// Per-session ordering key; the source of truth for "what happened when".
    pub seq: u64,
    /// `None` for history recorded outside any run.
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub source: EventSource,
    #[serde(flatten)]
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}
