// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::dag::TaskSpec;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// max_concurrent = 5
/// max_retries = 3
///
/// [runs]
/// run_timeout_secs = 3600
///
/// [events]
/// journal_dir = ".runweave/events"
///
/// [server]
/// port = 3030
/// ```
///
/// All sections are optional and have reasonable defaults. This is the
/// *unvalidated* form; convert with `ConfigFile::try_from`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub runs: RunsSection,

    #[serde(default)]
    pub events: EventsSection,

    #[serde(default)]
    pub server: ServerSection,
}

/// Validated configuration.
///
/// Only constructible through `TryFrom<RawConfigFile>` (or
/// [`ConfigFile::default`]), so holders can rely on the limits being sane.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub runs: RunsSection,
    pub events: EventsSection,
    pub server: ServerSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            scheduler: raw.scheduler,
            runs: raw.runs,
            events: raw.events,
            server: raw.server,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(RawConfigFile::default())
    }
}

/// `[scheduler]` section: worker pool and failure policy for plan execution.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Maximum number of tasks of one plan in flight at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Default retry budget for tasks that don't specify their own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff (`base * 2^attempt`).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// A task in flight for longer than this is failed (retryable) by the sweep.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// How often the timeout sweep runs.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl SchedulerSection {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// `[runs]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RunsSection {
    /// Runs stuck in `running` longer than this are failed by the run sweep.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Upper bound on model/tool round trips in a single tool-loop turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
}

fn default_run_timeout_secs() -> u64 {
    3_600
}

fn default_max_tool_iterations() -> u32 {
    16
}

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

impl RunsSection {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// `[events]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    /// Directory for per-session JSONL journals. `None` keeps the log in memory.
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,

    /// Capacity of each session's live broadcast channel.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            journal_dir: None,
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3030
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// A plan described on disk, used by `runweave plan`.
///
/// ```toml
/// goal = "build the landing page"
///
/// [[task]]
/// id = "hero"
/// cmd = "./gen.sh hero"
///
/// [[task]]
/// id = "export"
/// cmd = "./export.sh"
/// depends_on = ["hero"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    pub goal: String,

    #[serde(default, rename = "task")]
    pub tasks: Vec<PlanTaskEntry>,
}

/// One `[[task]]` entry of a [`PlanFile`].
#[derive(Debug, Clone, Deserialize)]
pub struct PlanTaskEntry {
    pub id: String,

    /// Shell command executed for this task.
    pub cmd: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default = "default_true")]
    pub can_parallel: bool,

    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(default)]
    pub tolerate_skipped: bool,
}

fn default_true() -> bool {
    true
}

impl PlanFile {
    /// Task specs for the task graph store; `cmd` travels in `metadata.cmd`.
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        self.tasks.iter().map(PlanTaskEntry::to_spec).collect()
    }
}

impl PlanTaskEntry {
    pub fn to_spec(&self) -> TaskSpec {
        TaskSpec {
            key: self.id.clone(),
            title: self.title.clone().unwrap_or_else(|| self.id.clone()),
            description: self.cmd.clone(),
            depends_on: self.depends_on.clone(),
            can_parallel: self.can_parallel,
            required: self.required,
            tolerate_skipped: self.tolerate_skipped,
            max_retries: self.max_retries,
            metadata: json!({ "cmd": self.cmd }),
        }
    }
}
