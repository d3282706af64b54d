// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Task-level failures are *data* (see [`crate::dag::TaskError`]) and never
//! surface through this type; these variants describe misuse of the engine
//! or failures of the engine's own IO.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunweaveError {
    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} already has an active execution")]
    RunBusy { run_id: String },

    #[error("Run {run_id} cannot {action} while {status}")]
    RunStateConflict {
        run_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Plan {plan_id} cannot {action} while {status}")]
    PlanStateConflict {
        plan_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RunweaveError>;
