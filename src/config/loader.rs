// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{ConfigFile, PlanFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Like [`load_and_validate`], but a missing file yields the defaults.
///
/// Present-but-broken files are still an error.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "config file not found; using defaults");
        return Ok(ConfigFile::default());
    }
    load_and_validate(path)
}

/// Load a plan description (goal + `[[task]]` entries).
///
/// Graph validation (unknown dependencies, cycles) happens when the plan is
/// materialized in the task graph store, so a cyclic plan file loads fine
/// here and is rejected by `create_plan`.
pub fn load_plan_file(path: impl AsRef<Path>) -> Result<PlanFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let plan: PlanFile = toml::from_str(&contents)?;
    Ok(plan)
}
