// src/dag/scheduler_step.rs

//! Step-by-step execution result types for the scheduler.

use std::time::Duration;

use crate::dag::model::{PlanStatus, ScheduledTask};
use crate::events::EventKind;
use crate::types::TaskId;

/// A failed attempt that should be re-admitted after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryScheduled {
    pub task_id: TaskId,
    pub delay: Duration,
}

/// Structured result of a single scheduler "step".
///
/// The scheduler never performs IO itself; the runtime turns a step into
/// spawned workers, timers and appended events. Tests can drive the
/// scheduler by hand and assert on these fields directly.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Tasks that moved to `in_progress` and need a worker now.
    pub dispatched: Vec<ScheduledTask>,
    /// Retry timers to arm.
    pub retries: Vec<RetryScheduled>,
    /// Events to append, in order.
    pub events: Vec<EventKind>,
    /// In-flight workers whose result is no longer wanted.
    pub abort_workers: Vec<TaskId>,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
            && self.retries.is_empty()
            && self.events.is_empty()
            && self.abort_workers.is_empty()
    }

    /// Append `other` after everything already in `self`.
    pub fn merge(&mut self, other: SchedulerStep) {
        self.dispatched.extend(other.dispatched);
        self.retries.extend(other.retries);
        self.events.extend(other.events);
        self.abort_workers.extend(other.abort_workers);
    }

    pub(crate) fn event(&mut self, kind: EventKind) {
        self.events.push(kind);
    }
}

/// How one execution of a plan ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// Nothing is left to run; the plan has a terminal status.
    Finished(PlanStatus),
    /// Cancellation stopped dispatch; untouched tasks stay `pending`.
    Cancelled,
    /// A task asked for input. The plan stays `in_progress` and the task
    /// `pending` until the answer arrives.
    WaitingInput { task_id: TaskId, prompt: String },
}
