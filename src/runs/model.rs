// src/runs/model.rs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RunId, SessionId};

/// Lifecycle state of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    /// Suspended on a user interaction; no work is in progress.
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::WaitingInput => "waiting_input",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    UserMessage,
    Resume,
    Retry,
    System,
}

/// Counters reported by drivers, plus the run's wall-clock duration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub duration_ms: Option<u64>,
    pub tasks_total: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
    pub tasks_blocked: usize,
    pub tasks_skipped: usize,
    pub tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RunMetrics {
    /// Fold counters reported by one drive into the run's totals.
    ///
    /// Task counters describe the plan's current state and replace the old
    /// values; call/token counters accumulate across resumes.
    pub fn absorb(&mut self, other: &RunMetrics) {
        if other.tasks_total > 0 {
            self.tasks_total = other.tasks_total;
            self.tasks_done = other.tasks_done;
            self.tasks_failed = other.tasks_failed;
            self.tasks_blocked = other.tasks_blocked;
            self.tasks_skipped = other.tasks_skipped;
        }
        self.tool_calls += other.tool_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One logical invocation of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub session_id: SessionId,
    pub parent_run_id: Option<RunId>,
    pub trigger_source: TriggerSource,
    pub status: RunStatus,
    pub input: Value,
    /// Driver state saved when the run suspended.
    pub resume_payload: Option<Value>,
    pub waiting_reason: Option<String>,
    pub checkpoint_key: String,
    pub latest_error: Option<String>,
    pub output: Option<Value>,
    pub metrics: RunMetrics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`RunManager::cancel`](super::RunManager::cancel).
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The run had already finished; nothing changed.
    AlreadyTerminal(Run),
    /// The run was cancelled synchronously.
    Cancelled(Run),
    /// The driver was signalled; the run becomes `cancelled` when it returns.
    Pending(Run),
}

impl CancelOutcome {
    pub fn run(&self) -> &Run {
        match self {
            CancelOutcome::AlreadyTerminal(run)
            | CancelOutcome::Cancelled(run)
            | CancelOutcome::Pending(run) => run,
        }
    }
}
