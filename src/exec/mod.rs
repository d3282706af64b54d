// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] defines the `TaskExecutor` trait the runtime dispatches
//!   to, and the `TaskOutcome` it reports back.
//! - [`command`] runs a task's shell command with `tokio::process`.
//! - [`policy`] wraps any executor with pre/post tool policy hooks.

pub mod backend;
pub mod command;
pub mod policy;

pub use backend::{ExecFuture, TaskExecutor, TaskOutcome};
pub use command::CommandExecutor;
pub use policy::{
    AllowAll, DenyList, PolicyContext, PolicyDecision, PolicyGuardedExecutor, ToolPolicy,
};
