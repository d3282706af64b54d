// tests/config.rs

use std::fs;
use std::time::Duration;

use tempfile::tempdir;

use runweave::config::{load_and_validate, load_or_default, load_plan_file};
use runweave::dag::TaskGraphStore;
use runweave::dag::graph::validate_specs;
use runweave::errors::RunweaveError;
use runweave::events::EventLog;
use runweave_test_utils::ConfigFileBuilder;

#[test]
fn full_config_file_is_loaded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("runweave.toml");
    fs::write(
        &path,
        r#"
[scheduler]
max_concurrent = 8
max_retries = 5
retry_base_ms = 250
retry_max_ms = 4000
task_timeout_secs = 90
sweep_interval_ms = 500

[runs]
run_timeout_secs = 120
max_tool_iterations = 12

[events]
journal_dir = "journal"
subscriber_buffer = 64

[server]
bind = "0.0.0.0"
port = 8080
"#,
    )
    .unwrap();

    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(cfg.scheduler.max_concurrent, 8);
    assert_eq!(cfg.scheduler.max_retries, 5);
    assert_eq!(cfg.scheduler.task_timeout(), Duration::from_secs(90));
    assert_eq!(cfg.scheduler.sweep_interval(), Duration::from_millis(500));
    assert_eq!(cfg.runs.run_timeout(), Duration::from_secs(120));
    assert_eq!(cfg.runs.max_tool_iterations, 12);
    assert_eq!(cfg.events.journal_dir.as_deref(), Some(std::path::Path::new("journal")));
    assert_eq!(cfg.events.subscriber_buffer, 64);
    assert_eq!(cfg.server.bind, "0.0.0.0");
    assert_eq!(cfg.server.port, 8080);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let cfg = load_or_default(dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.scheduler.max_concurrent, 5);
    assert_eq!(cfg.scheduler.max_retries, 3);
    assert!(cfg.events.journal_dir.is_none());
}

#[test]
fn broken_files_are_errors_even_with_defaults_allowed() {
    let dir = tempdir().unwrap();

    let bad_toml = dir.path().join("bad.toml");
    fs::write(&bad_toml, "[scheduler\nmax_concurrent = 1").unwrap();
    assert!(matches!(
        load_or_default(&bad_toml),
        Err(RunweaveError::TomlError(_))
    ));

    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, "[events]\nsubscriber_buffer = 0\n").unwrap();
    match load_or_default(&invalid) {
        Err(RunweaveError::ConfigError(msg)) => assert!(msg.contains("subscriber_buffer")),
        other => panic!("expected ConfigError, got {other:?}"),
    }

    let zero_iterations = dir.path().join("iterations.toml");
    fs::write(&zero_iterations, "[runs]\nmax_tool_iterations = 0\n").unwrap();
    assert!(matches!(
        load_and_validate(&zero_iterations),
        Err(RunweaveError::ConfigError(_))
    ));
}

#[test]
fn builder_config_feeds_the_event_log() {
    let dir = tempdir().unwrap();
    let cfg = ConfigFileBuilder::new()
        .max_concurrent(2)
        .journal_dir(dir.path().join("events"))
        .build();

    let log = EventLog::from_config(&cfg.events).unwrap();
    log.append(
        "s",
        None,
        runweave::events::EventKind::RunStarted,
    )
    .unwrap();
    assert!(dir.path().join("events").is_dir());
}

#[test]
fn plan_file_becomes_task_specs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plan.toml");
    fs::write(
        &path,
        r#"
goal = "landing page"

[[task]]
id = "hero"
cmd = "./gen.sh hero"

[[task]]
id = "pricing"
title = "Pricing table"
cmd = "./gen.sh pricing"
max_retries = 1
required = false

[[task]]
id = "export"
cmd = "./export.sh"
depends_on = ["hero", "pricing"]
can_parallel = false
tolerate_skipped = true
"#,
    )
    .unwrap();

    let plan = load_plan_file(&path).unwrap();
    assert_eq!(plan.goal, "landing page");
    let specs = plan.task_specs();
    assert_eq!(specs.len(), 3);

    assert_eq!(specs[0].title, "hero");
    assert_eq!(specs[0].metadata["cmd"], "./gen.sh hero");
    assert_eq!(specs[1].title, "Pricing table");
    assert_eq!(specs[1].max_retries, Some(1));
    assert!(!specs[1].required);
    assert!(!specs[2].can_parallel);
    assert!(specs[2].tolerate_skipped);

    let order = validate_specs(&specs).unwrap();
    assert_eq!(order.last(), Some(&2));
}

#[test]
fn cyclic_plan_file_loads_but_is_rejected_by_the_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cycle.toml");
    fs::write(
        &path,
        r#"
goal = "loop"

[[task]]
id = "a"
cmd = "true"
depends_on = ["b"]

[[task]]
id = "b"
cmd = "true"
depends_on = ["a"]
"#,
    )
    .unwrap();

    let plan = load_plan_file(&path).unwrap();
    let specs = plan.task_specs();
    assert!(matches!(
        validate_specs(&specs),
        Err(RunweaveError::InvalidGraph(_))
    ));

    let store = TaskGraphStore::new();
    assert!(matches!(
        store.create_plan("s", &plan.goal, specs, 3),
        Err(RunweaveError::InvalidGraph(_))
    ));
    assert!(store.plans_for_session("s").is_empty());
}
