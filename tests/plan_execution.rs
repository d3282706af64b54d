// tests/plan_execution.rs

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use runweave::app::App;
use runweave::dag::{PlanStatus, TaskError, TaskErrorKind, TaskStatus};
use runweave::engine::{PlanDecision, apply_decision};
use runweave::events::{Event, EventKind, ReadFilter};
use runweave::exec::TaskOutcome;
use runweave::runs::{Run, RunStatus, TriggerSource};
use runweave::types::PlanId;
use runweave_test_utils::{
    AppBuilder, ScriptedExecutor, TaskSpecBuilder, init_tracing, plan_input, with_timeout,
};

async fn run_to_idle(app: &App, session: &str, input: Value) -> Run {
    let run = app
        .runs
        .create_run(session, input, TriggerSource::UserMessage, None)
        .unwrap();
    app.runs.start(run.id).unwrap();
    with_timeout(app.runs.wait_idle(run.id)).await.unwrap()
}

fn events(app: &App, session: &str) -> Vec<Event> {
    app.events.read(session, &ReadFilter::default())
}

fn count(events: &[Event], type_name: &str) -> usize {
    events.iter().filter(|e| e.type_name() == type_name).count()
}

fn created_plan(events: &[Event]) -> PlanId {
    events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::PlanCreated { plan_id, .. } => Some(*plan_id),
            _ => None,
        })
        .expect("plan_created event")
}

#[tokio::test]
async fn failed_task_blocks_only_its_dependents() {
    init_tracing();

    let executor = Arc::new(
        ScriptedExecutor::new().script("b", [TaskOutcome::Failure(TaskError::logic("bad page"))]),
    );
    let app = AppBuilder::new().build(executor.clone());

    let input = plan_input(
        "site",
        vec![
            TaskSpecBuilder::new("a").build(),
            TaskSpecBuilder::new("b").build(),
            TaskSpecBuilder::new("c").after("a").after("b").build(),
        ],
    );
    let run = run_to_idle(&app, "abc", input).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.latest_error.is_some());

    let log = events(&app, "abc");
    assert_eq!(count(&log, "task_failed"), 1);
    assert_eq!(count(&log, "task_blocked"), 1);

    let plan_id = created_plan(&log);
    assert_eq!(app.store.get_plan(&plan_id).unwrap().status, PlanStatus::Failed);
    assert_eq!(
        app.store.task_by_key(&plan_id, "a").unwrap().status,
        TaskStatus::Done
    );
    assert_eq!(
        app.store.task_by_key(&plan_id, "c").unwrap().status,
        TaskStatus::Blocked
    );
    assert_eq!(executor.attempts("b"), 1);
    assert_eq!(executor.attempts("c"), 0);

    let failed = log
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::TaskFailed {
                key,
                available_actions,
                ..
            } => Some((key.clone(), available_actions.len())),
            _ => None,
        })
        .unwrap();
    assert_eq!(failed, ("b".to_string(), 4));
}

#[tokio::test]
async fn concurrency_never_exceeds_the_limit() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(30)));
    let app = AppBuilder::new().max_concurrent(2).build(executor.clone());

    let tasks = (0..5)
        .map(|i| TaskSpecBuilder::new(&format!("t{i}")).build())
        .collect();
    let run = run_to_idle(&app, "pool", plan_input("five", tasks)).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(executor.calls().len(), 5);
    assert_eq!(executor.peak_concurrency(), 2);
    assert_eq!(run.metrics.tasks_done, 5);
}

#[tokio::test]
async fn exclusive_tasks_run_alone() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(20)));
    let app = AppBuilder::new().build(executor.clone());

    let tasks = vec![
        TaskSpecBuilder::new("x").exclusive().build(),
        TaskSpecBuilder::new("y").exclusive().build(),
        TaskSpecBuilder::new("z").exclusive().build(),
    ];
    let run = run_to_idle(&app, "excl", plan_input("serial", tasks)).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(executor.peak_concurrency(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_with_growing_backoff() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new().script(
        "flaky",
        [
            TaskOutcome::Failure(TaskError::transient("503")),
            TaskOutcome::Failure(TaskError::transient("503")),
        ],
    ));
    let app = AppBuilder::new().build(executor.clone());

    let run = run_to_idle(
        &app,
        "retry",
        plan_input("flaky", vec![TaskSpecBuilder::new("flaky").max_retries(3).build()]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(executor.attempts("flaky"), 3);

    let delays: Vec<u64> = events(&app, "retry")
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskRetrying { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![10, 20]);

    let attempts: Vec<u32> = executor.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_task() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new().script(
        "flaky",
        [
            TaskOutcome::Failure(TaskError::transient("503")),
            TaskOutcome::Failure(TaskError::transient("503")),
        ],
    ));
    let app = AppBuilder::new().build(executor.clone());

    let run = run_to_idle(
        &app,
        "exhaust",
        plan_input("flaky", vec![TaskSpecBuilder::new("flaky").max_retries(2).build()]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Failed);

    let log = events(&app, "exhaust");
    assert_eq!(count(&log, "task_retrying"), 1);
    assert_eq!(count(&log, "task_failed"), 1);
}

#[tokio::test]
async fn events_are_gap_free_and_causally_ordered() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(5)));
    let app = AppBuilder::new().max_concurrent(4).build(executor);

    let mut tasks: Vec<_> = (0..6)
        .map(|i| TaskSpecBuilder::new(&format!("p{i}")).build())
        .collect();
    tasks.push(
        (0..6)
            .fold(TaskSpecBuilder::new("join"), |b, i| b.after(&format!("p{i}")))
            .build(),
    );
    let run = run_to_idle(&app, "order", plan_input("fan-in", tasks)).await;
    assert_eq!(run.status, RunStatus::Completed);

    let log = events(&app, "order");
    let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=log.len() as u64).collect::<Vec<_>>());

    let position = |pred: &dyn Fn(&EventKind) -> bool| log.iter().position(|e| pred(&e.kind));
    for i in 0..6 {
        let key = format!("p{i}");
        let started = position(&|k| matches!(k, EventKind::TaskStarted { key: k2, .. } if *k2 == key));
        let done = position(&|k| matches!(k, EventKind::TaskDone { key: k2, .. } if *k2 == key));
        let join = position(&|k| matches!(k, EventKind::TaskStarted { key: k2, .. } if k2 == "join"));
        assert!(started < done);
        assert!(done < join);
    }

    let types: Vec<&str> = log.iter().map(|e| e.type_name()).collect();
    assert_eq!(types.first(), Some(&"run_queued"));
    assert_eq!(types.last(), Some(&"run_completed"));
    let plan_completed = types.iter().position(|t| *t == "plan_completed").unwrap();
    assert_eq!(plan_completed, types.len() - 2);
}

#[tokio::test]
async fn join_task_receives_dependency_results() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new());
    let app = AppBuilder::new().build(executor);

    let run = run_to_idle(
        &app,
        "inputs",
        plan_input(
            "pipe",
            vec![
                TaskSpecBuilder::new("a").build(),
                TaskSpecBuilder::new("b").after("a").build(),
            ],
        ),
    )
    .await;

    let output = run.output.unwrap();
    assert_eq!(output["results"]["a"]["key"], "a");
    assert_eq!(output["status"], "done");
    assert_eq!(output["summary"]["done"], 2);
}

#[tokio::test]
async fn skip_decision_lets_tolerant_dependents_run_on_the_next_drive() {
    init_tracing();

    let executor = Arc::new(
        ScriptedExecutor::new().script("b", [TaskOutcome::Failure(TaskError::logic("nope"))]),
    );
    let app = AppBuilder::new().build(executor.clone());

    let input = plan_input(
        "skip",
        vec![
            TaskSpecBuilder::new("b").build(),
            TaskSpecBuilder::new("c").after("b").tolerate_skipped().build(),
        ],
    );
    let first = run_to_idle(&app, "skip", input).await;
    assert_eq!(first.status, RunStatus::Failed);
    let plan_id = created_plan(&events(&app, "skip"));
    let b = app.store.task_by_key(&plan_id, "b").unwrap();

    apply_decision(&app.registry, &app.store, &app.events, plan_id, PlanDecision::Skip(b.id))
        .await
        .unwrap();
    assert_eq!(
        app.store.task_by_key(&plan_id, "c").unwrap().status,
        TaskStatus::Pending
    );

    let second = run_to_idle(&app, "skip", serde_json::json!({ "plan_id": plan_id })).await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(executor.attempts("c"), 1);

    let log = events(&app, "skip");
    assert_eq!(count(&log, "task_skipped"), 1);
    assert_eq!(count(&log, "task_unblocked"), 1);
}

#[tokio::test]
async fn retry_decision_requeues_a_failed_task() {
    init_tracing();

    let executor = Arc::new(
        ScriptedExecutor::new().script("b", [TaskOutcome::Failure(TaskError::logic("once"))]),
    );
    let app = AppBuilder::new().build(executor.clone());

    let input = plan_input(
        "retry",
        vec![
            TaskSpecBuilder::new("b").build(),
            TaskSpecBuilder::new("c").after("b").build(),
        ],
    );
    run_to_idle(&app, "redo", input).await;
    let plan_id = created_plan(&events(&app, "redo"));
    let b = app.store.task_by_key(&plan_id, "b").unwrap();

    apply_decision(&app.registry, &app.store, &app.events, plan_id, PlanDecision::Retry(b.id))
        .await
        .unwrap();

    let again = run_to_idle(&app, "redo", serde_json::json!({ "plan_id": plan_id })).await;
    assert_eq!(again.status, RunStatus::Completed);
    assert_eq!(app.store.get_plan(&plan_id).unwrap().status, PlanStatus::Done);
    assert_eq!(executor.attempts("b"), 2);
    assert_eq!(executor.attempts("c"), 1);
}

#[tokio::test]
async fn abort_during_execution_ends_the_plan_aborted() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new());
    let gate = executor.gate("slow");
    let app = AppBuilder::new().build(executor.clone());

    let mut sub = app.events.subscribe("abort");
    let run = app
        .runs
        .create_run(
            "abort",
            plan_input(
                "abort",
                vec![
                    TaskSpecBuilder::new("slow").build(),
                    TaskSpecBuilder::new("after").after("slow").build(),
                ],
            ),
            TriggerSource::UserMessage,
            None,
        )
        .unwrap();
    app.runs.start(run.id).unwrap();

    let plan_id = with_timeout(async {
        loop {
            let event = sub.recv().await.unwrap();
            if let EventKind::TaskStarted { plan_id, .. } = event.kind {
                return plan_id;
            }
        }
    })
    .await;
    assert!(app.registry.is_running(&plan_id));

    apply_decision(&app.registry, &app.store, &app.events, plan_id, PlanDecision::Abort)
        .await
        .unwrap();
    let run = with_timeout(app.runs.wait_idle(run.id)).await.unwrap();
    gate.add_permits(1);

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(app.store.get_plan(&plan_id).unwrap().status, PlanStatus::Aborted);
    let slow = app.store.task_by_key(&plan_id, "slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    assert_eq!(slow.error.unwrap().kind, TaskErrorKind::Aborted);
    assert_eq!(count(&events(&app, "abort"), "plan_aborted"), 1);
    assert!(!app.registry.is_running(&plan_id));
}

#[tokio::test]
async fn stuck_tasks_time_out() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new());
    let _gate = executor.gate("hang");
    let app = AppBuilder::new()
        .task_timeout(Duration::from_millis(50))
        .build(executor.clone());

    let run = run_to_idle(
        &app,
        "timeout",
        plan_input("hang", vec![TaskSpecBuilder::new("hang").max_retries(2).build()]),
    )
    .await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(executor.attempts("hang"), 2);

    let plan_id = created_plan(&events(&app, "timeout"));
    let task = app.store.task_by_key(&plan_id, "hang").unwrap();
    assert_eq!(task.error.unwrap().kind, TaskErrorKind::Timeout);
}

#[tokio::test]
async fn invalid_graph_fails_the_run_without_creating_a_plan() {
    init_tracing();

    let app = AppBuilder::new().build(Arc::new(ScriptedExecutor::new()));
    let input = plan_input(
        "cycle",
        vec![
            TaskSpecBuilder::new("a").after("b").build(),
            TaskSpecBuilder::new("b").after("a").build(),
        ],
    );
    let run = run_to_idle(&app, "cycle", input).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.latest_error.unwrap().contains("Invalid task graph"));
    assert!(app.store.plans_for_session("cycle").is_empty());
    assert_eq!(count(&events(&app, "cycle"), "plan_created"), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn shell_commands_run_end_to_end() {
    use runweave::config::ConfigFile;
    use runweave::exec::CommandExecutor;

    init_tracing();

    let app = App::open(ConfigFile::default(), Arc::new(CommandExecutor::new())).unwrap();
    let input = plan_input(
        "shell",
        vec![
            TaskSpecBuilder::new("hello").cmd("echo hello").build(),
            TaskSpecBuilder::new("show")
                .after("hello")
                .cmd("echo \"$RUNWEAVE_INPUTS\"")
                .build(),
        ],
    );
    let run = run_to_idle(&app, "shell", input).await;
    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.latest_error);

    let results = &run.output.unwrap()["results"];
    assert_eq!(results["hello"]["stdout"], "hello");
    assert!(results["show"]["stdout"].as_str().unwrap().contains("hello"));
}

#[tokio::test]
async fn second_run_on_a_live_plan_is_refused() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new());
    let gate = executor.gate("a");
    let app = AppBuilder::new().build(executor.clone());

    let plan = app
        .store
        .create_plan(
            "shared",
            "shared",
            vec![
                TaskSpecBuilder::new("a").build(),
                TaskSpecBuilder::new("b").after("a").build(),
            ],
            3,
        )
        .unwrap();
    let input = json!({ "plan_id": plan.id });

    let mut sub = app.events.subscribe("shared");
    let first = app
        .runs
        .create_run("shared", input.clone(), TriggerSource::UserMessage, None)
        .unwrap();
    app.runs.start(first.id).unwrap();
    with_timeout(async {
        loop {
            if let EventKind::TaskStarted { .. } = sub.recv().await.unwrap().kind {
                return;
            }
        }
    })
    .await;

    let second = run_to_idle(&app, "shared", input).await;
    assert_eq!(second.status, RunStatus::Failed);
    assert!(second.latest_error.unwrap().contains("another execution"));
    assert!(app.registry.is_running(&plan.id));

    gate.add_permits(1);
    let first = with_timeout(app.runs.wait_idle(first.id)).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(executor.keys(), vec!["a", "b"]);
    assert_eq!(count(&events(&app, "shared"), "task_started"), 2);
}
