// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, RunweaveError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = RunweaveError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_scheduler(cfg)?;
    validate_runs(cfg)?;
    validate_events(cfg)?;
    Ok(())
}

fn validate_scheduler(cfg: &RawConfigFile) -> Result<()> {
    let s = &cfg.scheduler;

    if s.max_concurrent == 0 {
        return Err(RunweaveError::ConfigError(
            "[scheduler].max_concurrent must be >= 1 (got 0)".to_string(),
        ));
    }

    if s.retry_base_ms > s.retry_max_ms {
        return Err(RunweaveError::ConfigError(format!(
            "[scheduler].retry_base_ms ({}) must not exceed retry_max_ms ({})",
            s.retry_base_ms, s.retry_max_ms
        )));
    }

    if s.task_timeout_secs == 0 {
        return Err(RunweaveError::ConfigError(
            "[scheduler].task_timeout_secs must be >= 1 (got 0)".to_string(),
        ));
    }

    if s.sweep_interval_ms == 0 {
        return Err(RunweaveError::ConfigError(
            "[scheduler].sweep_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(())
}

fn validate_runs(cfg: &RawConfigFile) -> Result<()> {
    if cfg.runs.max_tool_iterations == 0 {
        return Err(RunweaveError::ConfigError(
            "[runs].max_tool_iterations must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.runs.run_timeout_secs == 0 {
        return Err(RunweaveError::ConfigError(
            "[runs].run_timeout_secs must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_events(cfg: &RawConfigFile) -> Result<()> {
    if cfg.events.subscriber_buffer == 0 {
        return Err(RunweaveError::ConfigError(
            "[events].subscriber_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}
