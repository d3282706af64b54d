// src/config/mod.rs

//! Configuration loading and validation for runweave.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load engine config and plan files from disk (`loader.rs`).
//! - Validate limits and intervals (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_plan_file, load_or_default};
pub use model::{
    ConfigFile, EventsSection, PlanFile, PlanTaskEntry, RawConfigFile, RunsSection,
    SchedulerSection, ServerSection,
};
