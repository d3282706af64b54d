// src/runs/driver.rs

//! The work a run performs, behind the [`RunDriver`] trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::events::EventEmitter;
use crate::runs::model::RunMetrics;
use crate::types::{RunId, SessionId};

/// How the driver is being entered.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveMode {
    Start,
    /// Continue from the state saved at suspension, with the user's answer.
    Resume { state: Value, answer: Value },
}

/// How a drive ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    /// Suspend the run; `state` comes back in [`DriveMode::Resume`].
    WaitingInput { reason: String, state: Value },
    Failed(String),
    Cancelled,
}

/// Everything a driver gets to work with for one drive.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub input: Value,
    /// Cancelled on `cancel` or when the run sweep times the run out.
    pub cancel: CancellationToken,
    /// Emits into the run's session, tagged with the run id.
    pub emitter: EventEmitter,
    metrics: Arc<Mutex<RunMetrics>>,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        session_id: SessionId,
        input: Value,
        cancel: CancellationToken,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            run_id,
            session_id,
            input,
            cancel,
            emitter,
            metrics: Arc::new(Mutex::new(RunMetrics::default())),
        }
    }

    /// Update this drive's counters.
    pub fn record(&self, update: impl FnOnce(&mut RunMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    pub fn metrics(&self) -> RunMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub type DriveFuture<'a> = Pin<Box<dyn Future<Output = RunOutcome> + Send + 'a>>;

/// Runs the body of a run: a plan execution, a tool loop, ...
///
/// Failures are returned as [`RunOutcome::Failed`]; a panic is caught by the
/// manager and reported the same way.
pub trait RunDriver: Send + Sync {
    fn drive(&self, ctx: RunContext, mode: DriveMode) -> DriveFuture<'_>;
}

impl<T: RunDriver + ?Sized> RunDriver for Arc<T> {
    fn drive(&self, ctx: RunContext, mode: DriveMode) -> DriveFuture<'_> {
        (**self).drive(ctx, mode)
    }
}
