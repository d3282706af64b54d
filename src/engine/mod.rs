// src/engine/mod.rs

//! Plan execution engine.
//!
//! This module ties together:
//! - the per-plan scheduler ([`crate::dag::PlanScheduler`])
//! - the worker pool running tasks on a [`crate::exec::TaskExecutor`]
//! - the runtime event loop that reacts to:
//!   - task completions
//!   - retry timers
//!   - skip / retry / abort decisions
//!   - the periodic timeout sweep
//!   - cancellation
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]. [`registry`] lets callers reach a running
//! plan to deliver decisions.

use std::time::Duration;

use crate::config::SchedulerSection;
use crate::exec::TaskOutcome;
use crate::types::TaskId;

/// External decision about a plan's failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    Skip(TaskId),
    Retry(TaskId),
    Abort,
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// In-flight tasks older than this are failed with a `timeout` error.
    pub task_timeout: Duration,
    /// How often in-flight tasks are checked against `task_timeout`.
    pub sweep_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl From<&SchedulerSection> for RuntimeOptions {
    fn from(cfg: &SchedulerSection) -> Self {
        Self {
            task_timeout: cfg.task_timeout(),
            sweep_interval: cfg.sweep_interval(),
        }
    }
}

/// Events flowing into the runtime from workers, timers and callers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A worker finished one attempt of a task.
    TaskCompleted {
        task_id: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    },
    /// A retry backoff elapsed.
    RetryDue { task_id: TaskId },
    Decision(PlanDecision),
    /// Periodic check for overdue tasks.
    SweepTick,
    /// The owning run was cancelled.
    CancelRequested,
}

pub mod core;
pub mod event_handlers;
pub mod registry;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use registry::{PlanControl, PlanRegistry, apply_decision};
pub use runtime::PlanRuntime;
