// src/runs/mod.rs

//! Run lifecycle management.
//!
//! A [`Run`] is one logical invocation (one user turn, one retry, ...). The
//! [`RunManager`] owns run records and their state machine; the work itself
//! is done by a [`RunDriver`]: [`PlanDriver`] executes a task graph,
//! [`ToolLoopDriver`] runs a bounded model/tool loop.

pub mod driver;
pub mod guard;
pub mod manager;
pub mod model;
pub mod plan_driver;
pub mod sweep;
pub mod tool_loop;

pub use driver::{DriveFuture, DriveMode, RunContext, RunDriver, RunOutcome};
pub use guard::{CheckpointGuard, CheckpointMarkers};
pub use manager::{RunManager, RunManagerOptions};
pub use model::{CancelOutcome, Run, RunMetrics, RunStatus, TriggerSource};
pub use plan_driver::{PlanCheckpoint, PlanDriver, PlanInput};
pub use sweep::spawn_run_sweeper;
pub use tool_loop::{ModelTurn, ToolExchange, ToolInvoker, ToolLoopDriver, TurnModel, TurnUsage};
