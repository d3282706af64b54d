// src/dag/scheduler.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerSection;
use crate::dag::model::{
    PlanStatus, ScheduledTask, Task, TaskError, TaskErrorKind, TaskMark, TaskStatus,
};
use crate::dag::scheduler_step::{PlanOutcome, RetryScheduled, SchedulerStep};
use crate::dag::state_manager::DependencyState;
use crate::dag::store::TaskGraphStore;
use crate::errors::{Result, RunweaveError};
use crate::events::{EventKind, TaskAction};
use crate::exec::TaskOutcome;
use crate::types::{PlanId, TaskId};

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// `base * 2^attempt`, capped at `max`. `attempt` is zero-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Upper bound on tasks of one plan in flight at once.
    pub max_concurrent: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl From<&SchedulerSection> for SchedulerOptions {
    fn from(cfg: &SchedulerSection) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent,
            backoff: BackoffPolicy {
                base: Duration::from_millis(cfg.retry_base_ms),
                max: Duration::from_millis(cfg.retry_max_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    attempt: u32,
    exclusive: bool,
    since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Running,
    Cancelled,
    WaitingInput,
    Aborted,
}

/// Per-plan scheduling state machine.
///
/// One `PlanScheduler` drives one execution of a plan. It owns no
/// threads or timers: every method mutates task state through the shared
/// [`TaskGraphStore`] and returns a [`SchedulerStep`] describing what the
/// caller should do next (spawn workers, arm retry timers, append events).
///
/// Responsibilities:
/// - dispatch ready tasks up to `max_concurrent` (honouring `can_parallel`)
/// - classify failures into retry / fail and block dependents
/// - apply `skip` / `retry` / `abort` decisions
/// - decide when the execution is finished and with which outcome
#[derive(Debug)]
pub struct PlanScheduler {
    store: Arc<TaskGraphStore>,
    plan_id: PlanId,
    options: SchedulerOptions,
    in_flight: HashMap<TaskId, InFlight>,
    answers: HashMap<TaskId, Value>,
    halt: Halt,
    waiting: Option<(TaskId, String)>,
}

impl PlanScheduler {
    pub fn new(store: Arc<TaskGraphStore>, plan_id: PlanId, options: SchedulerOptions) -> Self {
        Self {
            store,
            plan_id,
            options,
            in_flight: HashMap::new(),
            answers: HashMap::new(),
            halt: Halt::Running,
            waiting: None,
        }
    }

    /// A scheduler that applies decisions but never dispatches.
    ///
    /// For plans with no execution in progress; the next execution picks up
    /// whatever state the decisions left behind.
    pub fn detached(store: Arc<TaskGraphStore>, plan_id: PlanId) -> Self {
        let mut scheduler = Self::new(store, plan_id, SchedulerOptions::default());
        scheduler.halt = Halt::Cancelled;
        scheduler
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Deliver `answer` to the next dispatch of `task_id`.
    pub fn provide_answer(&mut self, task_id: TaskId, answer: Value) {
        self.answers.insert(task_id, answer);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, task_id: &TaskId) -> bool {
        self.in_flight.contains_key(task_id)
    }

    /// Whether new dispatch has been stopped (cancel, input request, abort).
    pub fn is_halted(&self) -> bool {
        self.halt != Halt::Running
    }

    /// Begin (or continue) executing the plan.
    ///
    /// Tasks left `in_progress` or `retrying` by an earlier execution are
    /// put back to `pending`, dependents of failed tasks are blocked, and
    /// the first wave is dispatched.
    pub fn start(&mut self) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let plan = self.store.get_plan(&self.plan_id)?;

        match plan.status {
            PlanStatus::Aborted => {
                debug!(plan = %self.plan_id, "plan was aborted; nothing to run");
                self.halt = Halt::Aborted;
                return Ok(step);
            }
            PlanStatus::Done => {
                debug!(plan = %self.plan_id, "plan already done");
                return Ok(step);
            }
            _ => {}
        }

        if self.store.set_plan_status(&self.plan_id, PlanStatus::InProgress)? {
            info!(plan = %self.plan_id, goal = %plan.goal, "plan started");
            step.event(EventKind::PlanStarted {
                plan_id: self.plan_id,
            });
        }

        for task in self.store.tasks_of(&self.plan_id)? {
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Retrying)
                && !self.in_flight.contains_key(&task.id)
            {
                debug!(task = %task.id, key = %task.key, from = %task.status, "requeue leftover task");
                self.store.mark(&task.id, TaskMark::Pending)?;
            }
        }

        self.block_doomed(&mut step)?;
        step.merge(self.dispatch()?);
        Ok(step)
    }

    /// Dispatch ready tasks into the free worker slots.
    pub fn dispatch(&mut self) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        if self.is_halted() {
            return Ok(step);
        }
        if self.in_flight.values().any(|f| f.exclusive) {
            return Ok(step);
        }

        for task in self.store.get_ready_tasks(&self.plan_id)? {
            if self.in_flight.len() >= self.options.max_concurrent {
                break;
            }
            if !task.can_parallel {
                // Runs alone; later tasks wait behind it so it cannot starve.
                if self.in_flight.is_empty() {
                    self.launch(task, &mut step)?;
                }
                break;
            }
            self.launch(task, &mut step)?;
        }

        Ok(step)
    }

    fn launch(&mut self, task: Task, step: &mut SchedulerStep) -> Result<()> {
        let updated = self.store.mark(&task.id, TaskMark::InProgress)?;
        let task = updated.task().clone();
        let attempt = task.retry_count;

        self.in_flight.insert(
            task.id,
            InFlight {
                attempt,
                exclusive: !task.can_parallel,
                since: Instant::now(),
            },
        );

        debug!(task = %task.id, key = %task.key, attempt, "dispatching task");
        step.event(EventKind::TaskStarted {
            plan_id: self.plan_id,
            task_id: task.id,
            key: task.key.clone(),
            attempt,
        });

        let inputs = self.store.inputs_for(&task.id)?;
        step.dispatched.push(ScheduledTask {
            task_id: task.id,
            plan_id: self.plan_id,
            key: task.key,
            title: task.title,
            description: task.description,
            metadata: task.metadata,
            attempt,
            inputs,
            answer: self.answers.remove(&task.id),
        });
        Ok(())
    }

    /// React to a worker finishing `task_id`.
    ///
    /// Results from attempts that are no longer in flight (timed out,
    /// skipped, aborted) are ignored.
    pub fn on_completion(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    ) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();

        match self.in_flight.get(&task_id) {
            Some(f) if f.attempt == attempt => {
                self.in_flight.remove(&task_id);
            }
            _ => {
                debug!(task = %task_id, attempt, "stale completion ignored");
                return Ok(step);
            }
        }

        match outcome {
            TaskOutcome::Success(result) => {
                let marked = self.store.mark(&task_id, TaskMark::Done { result })?;
                if marked.is_applied() {
                    let task = marked.task();
                    debug!(task = %task_id, key = %task.key, "task done");
                    step.event(EventKind::TaskDone {
                        plan_id: self.plan_id,
                        task_id,
                        key: task.key.clone(),
                        result: task.result.clone().unwrap_or(Value::Null),
                    });
                }
            }
            TaskOutcome::Failure(error) => {
                self.fail_attempt(task_id, error, &mut step)?;
            }
            TaskOutcome::NeedsInput(prompt) => {
                let marked = self.store.mark(&task_id, TaskMark::Pending)?;
                let key = marked.task().key.clone();
                info!(task = %task_id, key = %key, "task needs input; draining plan");
                step.event(EventKind::TaskWaitingInput {
                    plan_id: self.plan_id,
                    task_id,
                    key,
                    prompt: prompt.clone(),
                });
                if self.waiting.is_none() {
                    self.waiting = Some((task_id, prompt));
                }
                if self.halt == Halt::Running {
                    self.halt = Halt::WaitingInput;
                }
            }
        }

        step.merge(self.dispatch()?);
        Ok(step)
    }

    /// A retry timer fired: put the task back into the ready queue.
    pub fn on_retry_due(&mut self, task_id: TaskId) -> Result<SchedulerStep> {
        let task = self.store.get_task(&task_id)?;
        if task.status != TaskStatus::Retrying {
            debug!(task = %task_id, status = %task.status, "retry timer for settled task");
            return Ok(SchedulerStep::default());
        }
        self.store.mark(&task_id, TaskMark::Pending)?;
        self.dispatch()
    }

    /// In-flight tasks that have been running for longer than `timeout`.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<TaskId> {
        self.in_flight
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.since) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Treat an overdue task as a retryable `timeout` failure and abort its
    /// worker.
    pub fn on_timeout(&mut self, task_id: TaskId) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        if self.in_flight.remove(&task_id).is_none() {
            return Ok(step);
        }

        warn!(task = %task_id, "task timed out");
        step.abort_workers.push(task_id);
        self.fail_attempt(
            task_id,
            TaskError::new(TaskErrorKind::Timeout, "task timed out"),
            &mut step,
        )?;
        step.merge(self.dispatch()?);
        Ok(step)
    }

    fn fail_attempt(
        &mut self,
        task_id: TaskId,
        error: TaskError,
        step: &mut SchedulerStep,
    ) -> Result<()> {
        let task = self.store.get_task(&task_id)?;

        if error.kind == TaskErrorKind::Policy {
            let tool = error
                .detail
                .as_ref()
                .and_then(|d| d.get("tool"))
                .and_then(Value::as_str)
                .unwrap_or(&task.key);
            step.event(EventKind::ToolPolicyBlocked {
                tool: tool.to_string(),
                reason: error.message.clone(),
                task_id: Some(task_id),
            });
        }

        let attempts = task.retry_count + 1;
        if error.kind.is_retryable() && attempts < task.max_retries {
            let delay = self.options.backoff.delay_for(attempts - 1);
            self.store.mark(
                &task_id,
                TaskMark::Retrying {
                    error: error.clone(),
                },
            )?;

            info!(
                task = %task_id,
                key = %task.key,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task failed; retrying"
            );
            step.event(EventKind::TaskRetrying {
                plan_id: self.plan_id,
                task_id,
                key: task.key,
                attempt: attempts,
                delay_ms: delay.as_millis() as u64,
                error,
            });
            step.retries.push(RetryScheduled { task_id, delay });
            return Ok(());
        }

        self.store.mark(
            &task_id,
            TaskMark::Failed {
                error: error.clone(),
            },
        )?;
        warn!(task = %task_id, key = %task.key, error = %error, "task failed");
        step.event(EventKind::TaskFailed {
            plan_id: self.plan_id,
            task_id,
            key: task.key,
            error,
            available_actions: TaskAction::ALL.to_vec(),
        });

        self.block_descendants(&task_id, step)
    }

    /// Block every pending descendant of `root` that can no longer run.
    fn block_descendants(&mut self, root: &TaskId, step: &mut SchedulerStep) -> Result<()> {
        for id in self.store.descendants(root)? {
            self.block_if_doomed(&id, step)?;
        }
        Ok(())
    }

    /// Block every pending task of the plan with a fatal dependency.
    fn block_doomed(&mut self, step: &mut SchedulerStep) -> Result<()> {
        let roots: Vec<TaskId> = self
            .store
            .tasks_of(&self.plan_id)?
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
            .map(|t| t.id)
            .collect();

        for root in roots {
            self.block_descendants(&root, step)?;
        }
        Ok(())
    }

    fn block_if_doomed(&mut self, id: &TaskId, step: &mut SchedulerStep) -> Result<()> {
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        if let DependencyState::Fatal(blocked_by) = self.store.dependency_state(id)? {
            let marked = self.store.mark(id, TaskMark::Blocked { blocked_by })?;
            if marked.is_applied() {
                debug!(task = %id, key = %task.key, by = %blocked_by, "task blocked");
                step.event(EventKind::TaskBlocked {
                    plan_id: self.plan_id,
                    task_id: *id,
                    key: task.key,
                    blocked_by,
                });
            }
        }
        Ok(())
    }

    /// Return blocked descendants of `root` whose dependencies are no longer
    /// fatal to `pending`, and block newly doomed ones.
    fn reevaluate_descendants(&mut self, root: &TaskId, step: &mut SchedulerStep) -> Result<()> {
        for id in self.store.descendants(root)? {
            let task = self.store.get_task(&id)?;
            let state = self.store.dependency_state(&id)?;

            match (task.status, state) {
                (TaskStatus::Blocked, DependencyState::Satisfied | DependencyState::Waiting) => {
                    self.store.mark(&id, TaskMark::Pending)?;
                    debug!(task = %id, key = %task.key, "task unblocked");
                    step.event(EventKind::TaskUnblocked {
                        plan_id: self.plan_id,
                        task_id: id,
                        key: task.key,
                    });
                }
                (TaskStatus::Pending, DependencyState::Fatal(_)) => {
                    self.block_if_doomed(&id, step)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn ensure_own(&self, task: &Task) -> Result<()> {
        if task.plan_id != self.plan_id {
            return Err(RunweaveError::TaskNotFound(format!(
                "{} is not part of plan {}",
                task.id, self.plan_id
            )));
        }
        Ok(())
    }

    /// Force a task to `skipped` and re-evaluate its descendants.
    pub fn skip(&mut self, task_id: TaskId) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let task = self.store.get_task(&task_id)?;
        self.ensure_own(&task)?;

        if self.in_flight.remove(&task_id).is_some() {
            step.abort_workers.push(task_id);
        }

        let marked = self.store.mark(&task_id, TaskMark::Skipped)?;
        if marked.is_applied() {
            info!(task = %task_id, key = %task.key, "task skipped");
            step.event(EventKind::TaskSkipped {
                plan_id: self.plan_id,
                task_id,
                key: task.key,
            });
            self.reevaluate_descendants(&task_id, &mut step)?;
        }

        step.merge(self.dispatch()?);
        Ok(step)
    }

    /// Reset a failed task to `pending` with a fresh retry budget.
    pub fn retry(&mut self, task_id: TaskId) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let task = self.store.get_task(&task_id)?;
        self.ensure_own(&task)?;

        if task.status != TaskStatus::Failed {
            return Err(RunweaveError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: "pending (retry)".to_string(),
            });
        }

        self.store.mark(&task_id, TaskMark::Pending)?;
        info!(task = %task_id, key = %task.key, "task requeued by retry decision");
        step.event(EventKind::TaskRequeued {
            plan_id: self.plan_id,
            task_id,
            key: task.key,
        });
        self.reevaluate_descendants(&task_id, &mut step)?;

        step.merge(self.dispatch()?);
        Ok(step)
    }

    /// Fail every non-terminal task with reason `aborted` and end the plan
    /// `aborted`.
    pub fn abort(&mut self) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        if self.halt == Halt::Aborted {
            return Ok(step);
        }
        let plan = self.store.get_plan(&self.plan_id)?;
        if plan.status == PlanStatus::Done {
            return Err(RunweaveError::PlanStateConflict {
                plan_id: self.plan_id.to_string(),
                status: plan.status.to_string(),
                action: "abort",
            });
        }

        step.abort_workers.extend(self.in_flight.drain().map(|(id, _)| id));

        for task in self.store.tasks_of(&self.plan_id)? {
            if !task.status.is_active() {
                continue;
            }
            let error = TaskError::new(TaskErrorKind::Aborted, "aborted");
            let marked = self.store.mark(
                &task.id,
                TaskMark::Failed {
                    error: error.clone(),
                },
            )?;
            if marked.is_applied() {
                step.event(EventKind::TaskFailed {
                    plan_id: self.plan_id,
                    task_id: task.id,
                    key: task.key,
                    error,
                    available_actions: Vec::new(),
                });
            }
        }

        self.halt = Halt::Aborted;
        self.store.set_plan_status(&self.plan_id, PlanStatus::Aborted)?;
        warn!(plan = %self.plan_id, "plan aborted");
        step.event(EventKind::PlanAborted {
            plan_id: self.plan_id,
        });
        Ok(step)
    }

    /// Stop dispatching; in-flight tasks are allowed to finish.
    pub fn cancel(&mut self) {
        if self.halt == Halt::Running {
            info!(plan = %self.plan_id, in_flight = self.in_flight.len(), "plan execution cancelled");
            self.halt = Halt::Cancelled;
        }
    }

    /// Whether the execution has nothing left to wait for.
    pub fn is_finished(&self) -> Result<bool> {
        if !self.in_flight.is_empty() {
            return Ok(false);
        }
        if self.is_halted() {
            return Ok(true);
        }
        Ok(!self.store.any_active(&self.plan_id)?)
    }

    /// Settle the execution. Call once [`Self::is_finished`] holds.
    ///
    /// Marks the plan terminal (unless the run was cancelled or is waiting
    /// for input) and emits `plan_completed`.
    pub fn finish(&mut self) -> Result<(PlanOutcome, SchedulerStep)> {
        let mut step = SchedulerStep::default();

        match self.halt {
            Halt::Aborted => return Ok((PlanOutcome::Finished(PlanStatus::Aborted), step)),
            Halt::Cancelled => return Ok((PlanOutcome::Cancelled, step)),
            Halt::WaitingInput => {
                if let Some((task_id, prompt)) = self.waiting.clone() {
                    return Ok((PlanOutcome::WaitingInput { task_id, prompt }, step));
                }
            }
            Halt::Running => {}
        }

        let status = self.store.settled_status(&self.plan_id)?;
        let summary = self.store.plan_summary(&self.plan_id)?;
        if !self.store.set_plan_status(&self.plan_id, status)? {
            // Settled by an earlier execution; already reported.
            return Ok((PlanOutcome::Finished(status), step));
        }

        info!(
            plan = %self.plan_id,
            %status,
            done = summary.done,
            failed = summary.failed,
            blocked = summary.blocked,
            skipped = summary.skipped,
            "plan settled"
        );
        step.event(EventKind::PlanCompleted {
            plan_id: self.plan_id,
            status,
            summary,
        });
        Ok((PlanOutcome::Finished(status), step))
    }
}
