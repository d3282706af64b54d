// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use tokio::time::Instant;
use tracing::debug;

use crate::dag::{PlanScheduler, RetryScheduled, ScheduledTask, SchedulerStep};
use crate::engine::{PlanDecision, RuntimeOptions};
use crate::errors::Result;
use crate::events::EventKind;
use crate::exec::TaskOutcome;
use crate::types::TaskId;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Append these events to the log, in order.
    Emit(Vec<EventKind>),
    /// Stop these workers; their results are no longer wanted.
    AbortWorkers(Vec<TaskId>),
    /// Arm a timer that posts `RetryDue` after the delay.
    ArmRetry(RetryScheduled),
    /// Hand these tasks to the executor.
    DispatchTasks(Vec<ScheduledTask>),
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    /// Translate a scheduler step into shell commands.
    ///
    /// Events go first so `task_started` is in the log before the worker
    /// can report anything.
    pub fn from_scheduler(step: SchedulerStep, scheduler: &PlanScheduler) -> Result<Self> {
        let mut commands = Vec::new();

        if !step.events.is_empty() {
            commands.push(CoreCommand::Emit(step.events));
        }
        if !step.abort_workers.is_empty() {
            commands.push(CoreCommand::AbortWorkers(step.abort_workers));
        }
        commands.extend(step.retries.into_iter().map(CoreCommand::ArmRetry));
        if !step.dispatched.is_empty() {
            commands.push(CoreCommand::DispatchTasks(step.dispatched));
        }

        Ok(Self {
            commands,
            keep_running: !scheduler.is_finished()?,
        })
    }
}

pub fn handle_task_completion(
    scheduler: &mut PlanScheduler,
    task_id: TaskId,
    attempt: u32,
    outcome: TaskOutcome,
) -> Result<CoreStep> {
    let step = scheduler.on_completion(task_id, attempt, outcome)?;
    CoreStep::from_scheduler(step, scheduler)
}

pub fn handle_retry_due(scheduler: &mut PlanScheduler, task_id: TaskId) -> Result<CoreStep> {
    let step = scheduler.on_retry_due(task_id)?;
    CoreStep::from_scheduler(step, scheduler)
}

pub fn handle_decision(scheduler: &mut PlanScheduler, decision: PlanDecision) -> Result<CoreStep> {
    debug!(plan = %scheduler.plan_id(), ?decision, "applying plan decision");
    let step = match decision {
        PlanDecision::Skip(task_id) => scheduler.skip(task_id)?,
        PlanDecision::Retry(task_id) => scheduler.retry(task_id)?,
        PlanDecision::Abort => scheduler.abort()?,
    };
    CoreStep::from_scheduler(step, scheduler)
}

/// Fail every in-flight task that exceeded the task timeout.
pub fn handle_sweep(
    scheduler: &mut PlanScheduler,
    options: &RuntimeOptions,
    now: Instant,
) -> Result<CoreStep> {
    let mut step = SchedulerStep::default();
    for task_id in scheduler.overdue(now, options.task_timeout) {
        step.merge(scheduler.on_timeout(task_id)?);
    }
    CoreStep::from_scheduler(step, scheduler)
}

pub fn handle_cancel(scheduler: &mut PlanScheduler) -> Result<CoreStep> {
    scheduler.cancel();
    CoreStep::from_scheduler(SchedulerStep::default(), scheduler)
}
