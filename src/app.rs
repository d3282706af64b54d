// src/app.rs

//! Wiring of the engine's shared parts.

use std::sync::Arc;

use crate::config::ConfigFile;
use crate::dag::TaskGraphStore;
use crate::engine::PlanRegistry;
use crate::errors::Result;
use crate::events::EventLog;
use crate::exec::TaskExecutor;
use crate::runs::{PlanDriver, RunDriver, RunManager, RunManagerOptions};

/// Everything a caller (HTTP API, CLI, tests) needs to drive runs.
///
/// Cheap to clone; all parts are shared.
#[derive(Debug, Clone)]
pub struct App {
    pub config: Arc<ConfigFile>,
    pub store: Arc<TaskGraphStore>,
    pub events: Arc<EventLog>,
    pub registry: Arc<PlanRegistry>,
    pub runs: Arc<RunManager>,
}

impl App {
    /// Open the event log described by `[events]` and run plans on `executor`.
    pub fn open(config: ConfigFile, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        let events = Arc::new(EventLog::from_config(&config.events)?);
        Ok(Self::with_executor(config, events, executor))
    }

    /// Runs are driven by a [`PlanDriver`] over `executor`.
    pub fn with_executor(
        config: ConfigFile,
        events: Arc<EventLog>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let store = Arc::new(TaskGraphStore::new());
        let registry = Arc::new(PlanRegistry::new());
        let driver = PlanDriver::new(store.clone(), registry.clone(), executor, &config.scheduler);
        Self::with_driver(config, events, store, registry, Arc::new(driver))
    }

    /// Runs are driven by `driver`; `store` and `registry` are the ones it uses.
    pub fn with_driver(
        config: ConfigFile,
        events: Arc<EventLog>,
        store: Arc<TaskGraphStore>,
        registry: Arc<PlanRegistry>,
        driver: Arc<dyn RunDriver>,
    ) -> Self {
        let runs = RunManager::new(
            events.clone(),
            driver,
            RunManagerOptions::from(&config.runs),
        );
        Self {
            config: Arc::new(config),
            store,
            events,
            registry,
            runs,
        }
    }
}
