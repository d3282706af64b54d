// tests/event_log.rs

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use runweave::events::{EventKind, EventLog, EventSource, ReadFilter};
use runweave::runs::{RunStatus, TriggerSource};
use runweave_test_utils::{
    AppBuilder, ScriptedExecutor, TaskSpecBuilder, init_tracing, plan_input, with_timeout,
};

fn note(writer: usize, n: usize) -> EventKind {
    EventKind::Custom {
        name: "note".into(),
        source: EventSource::Session,
        data: json!({ "writer": writer, "n": n }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_get_unique_gap_free_seqs() {
    init_tracing();

    let log = Arc::new(EventLog::in_memory(16));
    let mut sub = log.subscribe("shared");

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let log = log.clone();
            tokio::spawn(async move {
                for n in 0..50 {
                    log.append("shared", None, note(w, n)).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let events = log.read("shared", &ReadFilter::default());
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=200).collect::<Vec<_>>());
    assert_eq!(log.last_seq("shared"), 200);

    // Each writer's own events keep their order.
    for w in 0..4 {
        let ns: Vec<u64> = events
            .iter()
            .filter(|e| matches!(&e.kind, EventKind::Custom { data, .. } if data["writer"] == w))
            .map(|e| match &e.kind {
                EventKind::Custom { data, .. } => data["n"].as_u64().unwrap(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ns, (0..50).collect::<Vec<_>>());
    }

    // The subscriber lagged behind a 16-slot buffer but still sees everything.
    let received = with_timeout(async {
        let mut seqs = Vec::new();
        while seqs.len() < 200 {
            seqs.push(sub.recv().await.unwrap().seq);
        }
        seqs
    })
    .await;
    assert_eq!(received, (1..=200).collect::<Vec<_>>());
}

#[tokio::test]
async fn sessions_are_numbered_independently() {
    let log = EventLog::in_memory(8);
    log.append("a", None, note(0, 0)).unwrap();
    log.append("a", None, note(0, 1)).unwrap();
    let first_b = log.append("b", None, note(1, 0)).unwrap();

    assert_eq!(first_b.seq, 1);
    assert_eq!(log.last_seq("a"), 2);
    assert_eq!(log.last_seq("missing"), 0);
    assert!(log.read("missing", &ReadFilter::default()).is_empty());

    let mut sessions = log.sessions();
    sessions.sort();
    assert_eq!(sessions, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn journal_survives_a_restart() {
    init_tracing();

    let dir = tempdir().unwrap();
    let events = Arc::new(EventLog::open(dir.path(), 64).unwrap());
    let app = AppBuilder::new()
        .events(events)
        .build(Arc::new(ScriptedExecutor::new()));

    let run = app
        .runs
        .create_run(
            "durable",
            plan_input(
                "persist",
                vec![
                    TaskSpecBuilder::new("one").build(),
                    TaskSpecBuilder::new("two").after("one").build(),
                ],
            ),
            TriggerSource::UserMessage,
            None,
        )
        .unwrap();
    app.runs.start(run.id).unwrap();
    let done = with_timeout(app.runs.wait_idle(run.id)).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let before = app.events.read("durable", &ReadFilter::default());
    drop(app);

    let reopened = EventLog::open(dir.path(), 64).unwrap();
    let after = reopened.read("durable", &ReadFilter::default());
    assert_eq!(after, before);

    let run_only = reopened.read("durable", &ReadFilter::since(3).for_run(run.id));
    assert!(run_only.iter().all(|e| e.seq > 3));

    let next = reopened.append("durable", None, note(0, 0)).unwrap();
    assert_eq!(next.seq, before.len() as u64 + 1);
    assert!(next.id > before.last().unwrap().id);
}

#[tokio::test]
async fn subscribe_from_replays_then_follows() {
    let log = Arc::new(EventLog::in_memory(8));
    for n in 0..3 {
        log.append("s", None, note(0, n)).unwrap();
    }

    let mut sub = log.subscribe_from("s", ReadFilter::since(1));
    log.append("s", None, note(0, 3)).unwrap();

    let seqs = with_timeout(async {
        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(sub.recv().await.unwrap().seq);
        }
        seqs
    })
    .await;
    assert_eq!(seqs, vec![2, 3, 4]);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn deleting_a_session_ends_its_subscriptions() {
    let dir = tempdir().unwrap();
    let log = EventLog::open(dir.path(), 8).unwrap();
    log.append("gone", None, note(0, 0)).unwrap();
    let mut sub = log.subscribe("gone");

    assert!(log.delete_session("gone").unwrap());
    assert!(!log.delete_session("gone").unwrap());
    assert!(log.read("gone", &ReadFilter::default()).is_empty());
    assert_eq!(with_timeout(sub.recv()).await, None);

    let reopened = EventLog::open(dir.path(), 8).unwrap();
    assert!(reopened.sessions().is_empty());
}
