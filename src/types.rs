// src/types.rs

//! Identifier aliases shared by every layer of the engine.

use uuid::Uuid;

/// Client-chosen session identifier; the scope of event ordering.
pub type SessionId = String;

pub type PlanId = Uuid;

pub type TaskId = Uuid;

pub type RunId = Uuid;

/// Key guarding the single active execution of a run: `session_id:run_id`.
pub fn checkpoint_key(session_id: &str, run_id: &RunId) -> String {
    format!("{session_id}:{run_id}")
}
