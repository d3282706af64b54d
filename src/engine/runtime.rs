// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dag::{PlanOutcome, PlanScheduler, RetryScheduled, ScheduledTask, TaskError};
use crate::errors::{Result, RunweaveError};
use crate::events::EventEmitter;
use crate::exec::{TaskExecutor, TaskOutcome};
use crate::types::TaskId;

use super::core::CoreRuntime;
use super::registry::{PlanControl, PlanRegistry};
use super::{CoreCommand, PlanDecision, RuntimeEvent, RuntimeOptions};

/// Messages accepted by a running [`PlanRuntime`].
#[derive(Debug)]
pub(crate) enum Inbox {
    Event(RuntimeEvent),
    Decide {
        decision: PlanDecision,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Drives one execution of a plan.
///
/// This is the IO shell around [`CoreRuntime`], which contains all the
/// scheduling semantics. The shell:
/// - spawns one Tokio task per dispatched task (bounded by the scheduler)
/// - arms retry timers that post `RetryDue` back into the loop
/// - runs the periodic timeout sweep
/// - watches the cancellation token
/// - appends every event the core produces to the event log
///
/// Dropping the runtime aborts its workers and timers.
pub struct PlanRuntime<E: TaskExecutor + ?Sized + 'static> {
    core: CoreRuntime,
    executor: Arc<E>,
    emitter: EventEmitter,
    cancel: CancellationToken,
    registry: Option<Arc<PlanRegistry>>,
    tx: mpsc::Sender<Inbox>,
    rx: mpsc::Receiver<Inbox>,
    workers: HashMap<TaskId, JoinHandle<()>>,
    timers: HashMap<TaskId, JoinHandle<()>>,
}

impl<E: TaskExecutor + ?Sized + 'static> fmt::Debug for PlanRuntime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanRuntime")
            .field("core", &self.core)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl<E: TaskExecutor + ?Sized + 'static> PlanRuntime<E> {
    pub fn new(
        scheduler: PlanScheduler,
        options: RuntimeOptions,
        executor: Arc<E>,
        emitter: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            core: CoreRuntime::new(scheduler, options),
            executor,
            emitter,
            cancel,
            registry: None,
            tx,
            rx,
            workers: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Make the runtime reachable through `registry` while it runs.
    pub fn with_registry(mut self, registry: Arc<PlanRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Handle for delivering decisions to this runtime.
    pub fn control(&self) -> PlanControl {
        PlanControl::new(self.tx.clone())
    }

    /// Main event loop.
    ///
    /// - Dispatches the first wave.
    /// - Feeds completions, timers, decisions, sweeps and cancellation into
    ///   the core runtime.
    /// - Executes the commands returned by the core.
    /// - Returns once the core reports nothing is left to wait for.
    pub async fn run(mut self) -> Result<PlanOutcome> {
        let plan_id = self.core.scheduler().plan_id();
        let _registration = match self.registry.clone() {
            Some(registry) => match registry.try_register(plan_id, self.control()) {
                Some(registration) => Some(registration),
                None => {
                    return Err(RunweaveError::PlanStateConflict {
                        plan_id: plan_id.to_string(),
                        status: "running in another execution".to_string(),
                        action: "start",
                    });
                }
            },
            None => None,
        };

        info!(plan = %plan_id, session = %self.emitter.session_id(), "plan runtime started");

        let step = self.core.start()?;
        let mut keep_running = step.keep_running;
        self.execute_commands(step.commands)?;

        let mut sweep = tokio::time::interval(self.core.options().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();
        let mut cancel_seen = false;

        while keep_running {
            let (event, reply) = tokio::select! {
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    (RuntimeEvent::CancelRequested, None)
                }
                _ = sweep.tick() => (RuntimeEvent::SweepTick, None),
                msg = self.rx.recv() => match msg {
                    Some(Inbox::Event(event)) => (event, None),
                    Some(Inbox::Decide { decision, reply }) => {
                        (RuntimeEvent::Decision(decision), Some(reply))
                    }
                    // We hold a sender ourselves, so this never happens.
                    None => break,
                },
            };

            match &event {
                RuntimeEvent::TaskCompleted { task_id, .. } => {
                    self.workers.remove(task_id);
                }
                RuntimeEvent::RetryDue { task_id } => {
                    self.timers.remove(task_id);
                }
                RuntimeEvent::SweepTick => {}
                other => debug!(plan = %plan_id, event = ?other, "runtime received event"),
            }

            let step = match (self.core.step(event, Instant::now()), reply) {
                (Ok(step), Some(reply)) => {
                    let _ = reply.send(Ok(()));
                    step
                }
                (Ok(step), None) => step,
                (Err(e), Some(reply)) => {
                    // A rejected decision leaves the execution untouched.
                    let _ = reply.send(Err(e));
                    continue;
                }
                (Err(e), None) => return Err(e),
            };

            keep_running = step.keep_running;
            self.execute_commands(step.commands)?;
        }

        self.stop_all();
        let (outcome, events) = self.core.finish()?;
        self.emitter.emit_all(events)?;

        info!(plan = %plan_id, ?outcome, "plan runtime finished");
        Ok(outcome)
    }

    fn execute_commands(&mut self, commands: Vec<CoreCommand>) -> Result<()> {
        for command in commands {
            match command {
                CoreCommand::Emit(events) => self.emitter.emit_all(events)?,
                CoreCommand::AbortWorkers(ids) => {
                    for id in ids {
                        if let Some(handle) = self.workers.remove(&id) {
                            debug!(task = %id, "aborting worker");
                            handle.abort();
                        }
                    }
                }
                CoreCommand::ArmRetry(retry) => self.arm_retry(retry),
                CoreCommand::DispatchTasks(tasks) => {
                    for task in tasks {
                        self.spawn_worker(task);
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(&mut self, task: ScheduledTask) {
        let executor = self.executor.clone();
        let tx = self.tx.clone();
        let task_id = task.task_id;
        let attempt = task.attempt;
        let key = task.key.clone();

        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(executor.execute(task)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(task = %task_id, key = %key, "task executor panicked");
                    TaskOutcome::Failure(TaskError::logic("task executor panicked"))
                }
            };

            let event = RuntimeEvent::TaskCompleted {
                task_id,
                attempt,
                outcome,
            };
            if tx.send(Inbox::Event(event)).await.is_err() {
                debug!(task = %task_id, "runtime gone; dropping task result");
            }
        });

        if let Some(previous) = self.workers.insert(task_id, handle) {
            previous.abort();
        }
    }

    fn arm_retry(&mut self, retry: RetryScheduled) {
        let tx = self.tx.clone();
        let RetryScheduled { task_id, delay } = retry;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(Inbox::Event(RuntimeEvent::RetryDue { task_id }))
                .await;
        });

        if let Some(previous) = self.timers.insert(task_id, handle) {
            previous.abort();
        }
    }

    fn stop_all(&mut self) {
        for (_, handle) in self.workers.drain() {
            handle.abort();
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl<E: TaskExecutor + ?Sized + 'static> Drop for PlanRuntime<E> {
    fn drop(&mut self) {
        self.stop_all();
    }
}
