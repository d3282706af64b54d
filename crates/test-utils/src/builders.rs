#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use runweave::app::App;
use runweave::config::{ConfigFile, RawConfigFile};
use runweave::dag::{BackoffPolicy, SchedulerOptions, TaskGraphStore, TaskSpec};
use runweave::engine::{PlanRegistry, RuntimeOptions};
use runweave::events::EventLog;
use runweave::exec::TaskExecutor;
use runweave::runs::PlanDriver;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.scheduler.max_concurrent = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.scheduler.max_retries = n;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.config.scheduler.retry_base_ms = base;
        self.config.scheduler.retry_max_ms = max;
        self
    }

    pub fn sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.sweep_interval_ms = ms;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.runs.run_timeout_secs = secs;
        self
    }

    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.events.journal_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskSpec`.
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            spec: TaskSpec::new(key),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.spec.depends_on.push(dep.to_string());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.spec.max_retries = Some(n);
        self
    }

    /// `can_parallel = false`.
    pub fn exclusive(mut self) -> Self {
        self.spec.can_parallel = false;
        self
    }

    /// `required = false`.
    pub fn optional(mut self) -> Self {
        self.spec.required = false;
        self
    }

    pub fn tolerate_skipped(mut self) -> Self {
        self.spec.tolerate_skipped = true;
        self
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.spec.metadata = json!({ "cmd": cmd });
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.spec.metadata = metadata;
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

/// Run input understood by `PlanDriver`.
pub fn plan_input(goal: &str, tasks: Vec<TaskSpec>) -> Value {
    json!({ "goal": goal, "tasks": tasks })
}

/// Builds an [`App`] whose plan driver uses millisecond-scale timings.
pub struct AppBuilder {
    config: ConfigFile,
    scheduler: SchedulerOptions,
    runtime: RuntimeOptions,
    events: Option<Arc<EventLog>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: ConfigFile::default(),
            scheduler: SchedulerOptions {
                max_concurrent: 5,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(10),
                    max: Duration::from_millis(50),
                },
            },
            runtime: RuntimeOptions {
                task_timeout: Duration::from_secs(5),
                sweep_interval: Duration::from_millis(20),
            },
            events: None,
        }
    }

    pub fn config(mut self, config: ConfigFile) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.scheduler.max_concurrent = n;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.runtime.task_timeout = timeout;
        self
    }

    pub fn events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self, executor: Arc<dyn TaskExecutor>) -> App {
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventLog::in_memory(256)));
        let store = Arc::new(TaskGraphStore::new());
        let registry = Arc::new(PlanRegistry::new());
        let driver = PlanDriver::new(
            store.clone(),
            registry.clone(),
            executor,
            &self.config.scheduler,
        )
        .with_options(self.scheduler, self.runtime);

        App::with_driver(self.config, events, store, registry, Arc::new(driver))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
