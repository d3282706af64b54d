// src/exec/backend.rs

//! Pluggable task executor abstraction.
//!
//! The runtime hands every dispatched task to a `TaskExecutor` instead of
//! running anything itself. Production code plugs in
//! [`CommandExecutor`](crate::exec::CommandExecutor) or a collaborator
//! (model calls, page generation, ...); tests provide scripted fakes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::dag::{ScheduledTask, TaskError};

/// What a single attempt of a task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Value),
    Failure(TaskError),
    /// The task cannot continue without an answer from the user.
    NeedsInput(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>;

/// Trait abstracting how scheduled tasks are executed.
///
/// Failures are reported as [`TaskOutcome::Failure`] with a classified
/// [`TaskError`]; the scheduler decides whether to retry. An executor
/// must tolerate its future being dropped mid-flight (abort, timeout).
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: ScheduledTask) -> ExecFuture<'_>;
}

impl<T: TaskExecutor + ?Sized> TaskExecutor for Arc<T> {
    fn execute(&self, task: ScheduledTask) -> ExecFuture<'_> {
        (**self).execute(task)
    }
}

impl<T: TaskExecutor + ?Sized> TaskExecutor for Box<T> {
    fn execute(&self, task: ScheduledTask) -> ExecFuture<'_> {
        (**self).execute(task)
    }
}
