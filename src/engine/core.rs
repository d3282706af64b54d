// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - updated task state (through the scheduler and the task graph store)
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async shell (`engine::runtime::PlanRuntime`) is responsible for:
//! - reading events from channels
//! - spawning workers and retry timers
//! - appending events to the log
//!
//! The core can be unit tested without channels, timers or processes.

use tokio::time::Instant;

use crate::dag::{PlanOutcome, PlanScheduler};
use crate::engine::event_handlers::{
    CoreStep, handle_cancel, handle_decision, handle_retry_due, handle_sweep,
    handle_task_completion,
};
use crate::engine::{RuntimeEvent, RuntimeOptions};
use crate::errors::Result;
use crate::events::EventKind;

/// Pure core runtime state.
#[derive(Debug)]
pub struct CoreRuntime {
    scheduler: PlanScheduler,
    options: RuntimeOptions,
}

impl CoreRuntime {
    pub fn new(scheduler: PlanScheduler, options: RuntimeOptions) -> Self {
        Self { scheduler, options }
    }

    pub fn scheduler(&self) -> &PlanScheduler {
        &self.scheduler
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Commands for the first wave of the execution.
    pub fn start(&mut self) -> Result<CoreStep> {
        let step = self.scheduler.start()?;
        CoreStep::from_scheduler(step, &self.scheduler)
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent, now: Instant) -> Result<CoreStep> {
        match event {
            RuntimeEvent::TaskCompleted {
                task_id,
                attempt,
                outcome,
            } => handle_task_completion(&mut self.scheduler, task_id, attempt, outcome),
            RuntimeEvent::RetryDue { task_id } => handle_retry_due(&mut self.scheduler, task_id),
            RuntimeEvent::Decision(decision) => handle_decision(&mut self.scheduler, decision),
            RuntimeEvent::SweepTick => handle_sweep(&mut self.scheduler, &self.options, now),
            RuntimeEvent::CancelRequested => handle_cancel(&mut self.scheduler),
        }
    }

    /// Settle the execution once the loop has stopped.
    pub fn finish(&mut self) -> Result<(PlanOutcome, Vec<EventKind>)> {
        let (outcome, step) = self.scheduler.finish()?;
        Ok((outcome, step.events))
    }
}
