// src/runs/manager.rs

//! Run lifecycle: `queued → running ⇄ waiting_input → terminal`.
//!
//! Every transition happens under the manager's lock and emits its event
//! before the new state becomes visible, so the event log never lags the
//! run records. A run has at most one execution attached, enforced by the
//! checkpoint marker held by the spawned driver task.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunsSection;
use crate::errors::{Result, RunweaveError};
use crate::events::{EventEmitter, EventKind, EventLog};
use crate::runs::driver::{DriveMode, RunContext, RunDriver, RunOutcome};
use crate::runs::guard::{CheckpointGuard, CheckpointMarkers};
use crate::runs::model::{CancelOutcome, Run, RunMetrics, RunStatus, TriggerSource};
use crate::types::{RunId, SessionId, checkpoint_key};

#[derive(Debug, Clone)]
pub struct RunManagerOptions {
    /// Runs `running` for longer than this are failed by [`RunManager::sweep_stuck`].
    pub run_timeout: Duration,
}

impl Default for RunManagerOptions {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(3_600),
        }
    }
}

impl From<&RunsSection> for RunManagerOptions {
    fn from(cfg: &RunsSection) -> Self {
        Self {
            run_timeout: cfg.run_timeout(),
        }
    }
}

struct RunEntry {
    run: Run,
    watch: watch::Sender<Run>,
    cancel: Option<CancellationToken>,
    driver: Option<AbortHandle>,
    /// Start of the current `running` stretch.
    running_since: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

impl RunEntry {
    fn publish(&mut self, now: DateTime<Utc>) {
        self.run.updated_at = now;
        self.watch.send_replace(self.run.clone());
    }

    /// Close the current `running` stretch into `metrics.duration_ms`.
    fn stop_clock(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.running_since.take() {
            let elapsed = (now - since).num_milliseconds().max(0) as u64;
            *self.run.metrics.duration_ms.get_or_insert(0) += elapsed;
        }
    }

    fn conflict(&self, action: &'static str) -> RunweaveError {
        RunweaveError::RunStateConflict {
            run_id: self.run.id.to_string(),
            status: self.run.status.to_string(),
            action,
        }
    }
}

pub struct RunManager {
    runs: Mutex<HashMap<RunId, RunEntry>>,
    events: Arc<EventLog>,
    driver: Arc<dyn RunDriver>,
    markers: Arc<CheckpointMarkers>,
    options: RunManagerOptions,
}

impl fmt::Debug for RunManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunManager")
            .field("runs", &self.runs().len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RunManager {
    pub fn new(
        events: Arc<EventLog>,
        driver: Arc<dyn RunDriver>,
        options: RunManagerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(HashMap::new()),
            events,
            driver,
            markers: CheckpointMarkers::new(),
            options,
        })
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    fn emitter_for(&self, run: &Run) -> EventEmitter {
        EventEmitter::new(self.events.clone(), run.session_id.clone(), Some(run.id))
    }

    /// Register a new run in `queued`.
    pub fn create_run(
        &self,
        session_id: impl Into<SessionId>,
        input: Value,
        trigger_source: TriggerSource,
        parent_run_id: Option<RunId>,
    ) -> Result<Run> {
        let session_id = session_id.into();
        let id: RunId = Uuid::new_v4();
        let now = Utc::now();
        let run = Run {
            id,
            checkpoint_key: checkpoint_key(&session_id, &id),
            session_id,
            parent_run_id,
            trigger_source,
            status: RunStatus::Queued,
            input,
            resume_payload: None,
            waiting_reason: None,
            latest_error: None,
            output: None,
            metrics: RunMetrics::default(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };

        let mut runs = self.runs();
        self.emitter_for(&run).emit(EventKind::RunQueued {
            trigger_source,
            parent_run_id,
        })?;

        let (watch, _) = watch::channel(run.clone());
        runs.insert(
            id,
            RunEntry {
                run: run.clone(),
                watch,
                cancel: None,
                driver: None,
                running_since: None,
                cancel_requested: false,
            },
        );

        info!(run_id = %id, session = %run.session_id, ?trigger_source, "run queued");
        Ok(run)
    }

    /// Start a `queued` run.
    ///
    /// Fails with `RunBusy` if an execution is already attached and with
    /// `RunStateConflict` if the run is not `queued`; neither mutates it.
    pub fn start(self: &Arc<Self>, run_id: RunId) -> Result<Run> {
        let guard = self.acquire(run_id)?;

        let mut runs = self.runs();
        let entry = runs
            .get_mut(&run_id)
            .ok_or_else(|| RunweaveError::RunNotFound(run_id.to_string()))?;
        if entry.run.status != RunStatus::Queued {
            return Err(entry.conflict("start"));
        }

        self.emitter_for(&entry.run).emit(EventKind::RunStarted)?;

        let now = Utc::now();
        entry.run.status = RunStatus::Running;
        entry.run.started_at = Some(now);
        self.attach(entry, DriveMode::Start, guard, now);

        info!(run_id = %run_id, "run started");
        Ok(entry.run.clone())
    }

    /// Resume a `waiting_input` run with the user's answer; the id is kept.
    pub fn resume(self: &Arc<Self>, run_id: RunId, answer: Value) -> Result<Run> {
        let guard = self.acquire(run_id)?;

        let mut runs = self.runs();
        let entry = runs
            .get_mut(&run_id)
            .ok_or_else(|| RunweaveError::RunNotFound(run_id.to_string()))?;
        if entry.run.status != RunStatus::WaitingInput {
            return Err(entry.conflict("resume"));
        }

        self.emitter_for(&entry.run).emit(EventKind::RunResumed)?;

        let state = entry.run.resume_payload.clone().unwrap_or(Value::Null);
        let now = Utc::now();
        entry.run.status = RunStatus::Running;
        entry.run.waiting_reason = None;
        self.attach(entry, DriveMode::Resume { state, answer }, guard, now);

        info!(run_id = %run_id, "run resumed");
        Ok(entry.run.clone())
    }

    fn acquire(&self, run_id: RunId) -> Result<CheckpointGuard> {
        let key = self.get(run_id)?.checkpoint_key;
        self.markers.try_acquire(&key).ok_or_else(|| {
            debug!(run_id = %run_id, "checkpoint marker already held");
            RunweaveError::RunBusy {
                run_id: run_id.to_string(),
            }
        })
    }

    /// Spawn the driver for a run that was just moved to `running`.
    fn attach(
        self: &Arc<Self>,
        entry: &mut RunEntry,
        mode: DriveMode,
        guard: CheckpointGuard,
        now: DateTime<Utc>,
    ) {
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(
            entry.run.id,
            entry.run.session_id.clone(),
            entry.run.input.clone(),
            cancel.clone(),
            self.emitter_for(&entry.run),
        );

        let manager = Arc::clone(self);
        let run_id = entry.run.id;
        let handle = tokio::spawn(async move {
            let report = ctx.clone();
            let outcome = match AssertUnwindSafe(manager.driver.drive(ctx, mode))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(run_id = %run_id, "run driver panicked");
                    RunOutcome::Failed("run driver panicked".to_string())
                }
            };
            manager.settle(run_id, outcome, report.metrics(), guard);
        });

        entry.cancel = Some(cancel);
        entry.driver = Some(handle.abort_handle());
        entry.running_since = Some(now);
        entry.cancel_requested = false;
        entry.publish(now);
    }

    /// Apply a driver's outcome. Releases the checkpoint marker.
    fn settle(&self, run_id: RunId, outcome: RunOutcome, metrics: RunMetrics, guard: CheckpointGuard) {
        let mut runs = self.runs();
        drop(guard);

        let Some(entry) = runs.get_mut(&run_id) else {
            warn!(run_id = %run_id, "driver finished for unknown run");
            return;
        };
        entry.driver = None;
        entry.cancel = None;

        if entry.run.status != RunStatus::Running {
            debug!(run_id = %run_id, status = %entry.run.status, "run settled elsewhere; dropping driver outcome");
            return;
        }

        let now = Utc::now();
        entry.stop_clock(now);
        entry.run.metrics.absorb(&metrics);

        let outcome = match outcome {
            RunOutcome::Completed(output) if entry.cancel_requested => {
                entry.run.output = Some(output);
                RunOutcome::Cancelled
            }
            RunOutcome::WaitingInput { .. } if entry.cancel_requested => RunOutcome::Cancelled,
            other => other,
        };

        let (status, kind) = match outcome {
            RunOutcome::Completed(output) => {
                entry.run.output = Some(output.clone());
                (RunStatus::Completed, EventKind::RunCompleted { output })
            }
            RunOutcome::WaitingInput { reason, state } => {
                entry.run.resume_payload = Some(state);
                entry.run.waiting_reason = Some(reason.clone());
                (RunStatus::WaitingInput, EventKind::RunWaitingInput { reason })
            }
            RunOutcome::Failed(error) => {
                entry.run.latest_error = Some(error.clone());
                (RunStatus::Failed, EventKind::RunFailed { error })
            }
            RunOutcome::Cancelled => (RunStatus::Cancelled, EventKind::RunCancelled),
        };

        if let Err(e) = self.emitter_for(&entry.run).emit(kind) {
            error!(run_id = %run_id, error = %e, "failed to record run outcome event");
        }

        entry.run.status = status;
        if status.is_terminal() {
            entry.run.finished_at = Some(now);
        }
        entry.publish(now);

        info!(run_id = %run_id, %status, "run settled");
    }

    /// Cancel a run.
    ///
    /// Terminal runs are left alone. `queued` and `waiting_input` runs are
    /// cancelled on the spot. A `running` run has its token cancelled and
    /// becomes `cancelled` once its driver returns.
    pub fn cancel(&self, run_id: RunId) -> Result<CancelOutcome> {
        let mut runs = self.runs();
        let entry = runs
            .get_mut(&run_id)
            .ok_or_else(|| RunweaveError::RunNotFound(run_id.to_string()))?;

        match entry.run.status {
            status if status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal(entry.run.clone())),
            RunStatus::Queued | RunStatus::WaitingInput => {
                self.emitter_for(&entry.run).emit(EventKind::RunCancelled)?;
                let now = Utc::now();
                entry.run.status = RunStatus::Cancelled;
                entry.run.waiting_reason = None;
                entry.run.finished_at = Some(now);
                entry.publish(now);
                info!(run_id = %run_id, "run cancelled");
                Ok(CancelOutcome::Cancelled(entry.run.clone()))
            }
            _ => {
                if !entry.cancel_requested {
                    self.emitter_for(&entry.run).emit(EventKind::RunCancelRequested)?;
                    entry.cancel_requested = true;
                    if let Some(token) = &entry.cancel {
                        token.cancel();
                    }
                    info!(run_id = %run_id, "run cancellation requested");
                }
                Ok(CancelOutcome::Pending(entry.run.clone()))
            }
        }
    }

    /// Create a fresh run with the same input as a failed or cancelled one.
    ///
    /// The new run is `queued`; the caller starts it.
    pub fn retry_run(&self, run_id: RunId) -> Result<Run> {
        let source = self.get(run_id)?;
        if !matches!(source.status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(RunweaveError::RunStateConflict {
                run_id: run_id.to_string(),
                status: source.status.to_string(),
                action: "retry",
            });
        }
        self.create_run(
            source.session_id,
            source.input,
            TriggerSource::Retry,
            Some(run_id),
        )
    }

    pub fn get(&self, run_id: RunId) -> Result<Run> {
        self.runs()
            .get(&run_id)
            .map(|entry| entry.run.clone())
            .ok_or_else(|| RunweaveError::RunNotFound(run_id.to_string()))
    }

    /// Runs ordered by creation, optionally restricted to one session.
    pub fn list(&self, session_id: Option<&str>) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs()
            .values()
            .filter(|entry| session_id.is_none_or(|s| entry.run.session_id == s))
            .map(|entry| entry.run.clone())
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    /// Receiver that observes every state change of a run.
    pub fn watch(&self, run_id: RunId) -> Result<watch::Receiver<Run>> {
        self.runs()
            .get(&run_id)
            .map(|entry| entry.watch.subscribe())
            .ok_or_else(|| RunweaveError::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run satisfies `predicate`.
    pub async fn wait_for(&self, run_id: RunId, predicate: impl FnMut(&Run) -> bool) -> Result<Run> {
        let mut rx = self.watch(run_id)?;
        let run = rx
            .wait_for(predicate)
            .await
            .map_err(|_| RunweaveError::RunNotFound(run_id.to_string()))?;
        Ok(run.clone())
    }

    /// Wait until no driver is attached: terminal or `waiting_input`.
    pub async fn wait_idle(&self, run_id: RunId) -> Result<Run> {
        self.wait_for(run_id, |run| {
            run.status.is_terminal() || run.status == RunStatus::WaitingInput
        })
        .await
    }

    /// Fail runs that have been `running` for longer than the run timeout.
    ///
    /// Their token is cancelled and their driver aborted; returns the ids
    /// that were failed.
    pub fn sweep_stuck(&self, now: DateTime<Utc>) -> Vec<RunId> {
        let Ok(timeout) = chrono::Duration::from_std(self.options.run_timeout) else {
            return Vec::new();
        };

        let mut swept = Vec::new();
        let mut runs = self.runs();
        for entry in runs.values_mut() {
            let overdue = entry.run.status == RunStatus::Running
                && entry.running_since.is_some_and(|since| now - since > timeout);
            if !overdue {
                continue;
            }

            let run_id = entry.run.id;
            warn!(run_id = %run_id, "run timed out");

            if let Some(token) = entry.cancel.take() {
                token.cancel();
            }
            if let Some(driver) = entry.driver.take() {
                driver.abort();
            }

            let error = "run timed out".to_string();
            if let Err(e) = self
                .emitter_for(&entry.run)
                .emit(EventKind::RunFailed { error: error.clone() })
            {
                error!(run_id = %run_id, error = %e, "failed to record run timeout event");
            }

            entry.stop_clock(now);
            entry.run.status = RunStatus::Failed;
            entry.run.latest_error = Some(error);
            entry.run.finished_at = Some(now);
            entry.publish(now);
            swept.push(run_id);
        }
        swept
    }
}
