// src/dag/mod.rs

//! Task graph: plans, tasks and their dependency edges.
//!
//! - [`model`] holds the Plan / Task records and their status enums.
//! - [`graph`] keeps adjacency for one plan and validates acyclicity.
//! - [`store`] is the task graph store: the only place task state mutates.
//! - [`state_manager`] answers readiness / blocking questions over a plan.
//! - [`scheduler`] contains the per-plan state machine that decides what to
//!   dispatch, retry, block or finish.
//! - [`scheduler_step`] defines the result type for scheduler steps.

pub mod graph;
pub mod model;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod store;

pub use graph::DagGraph;
pub use model::{
    Plan, PlanStatus, PlanSummary, ScheduledTask, Task, TaskError, TaskErrorKind, TaskMark,
    TaskSpec, TaskStatus,
};
pub use scheduler::{BackoffPolicy, PlanScheduler, SchedulerOptions};
pub use scheduler_step::{PlanOutcome, RetryScheduled, SchedulerStep};
pub use store::{MarkOutcome, TaskGraphStore};
