// tests/api.rs

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use futures::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use runweave::api::build_router;
use runweave::app::App;
use runweave::dag::TaskError;
use runweave::exec::TaskOutcome;
use runweave::runs::RunStatus;
use runweave::types::RunId;
use runweave_test_utils::{
    AppBuilder, ScriptedExecutor, TaskSpecBuilder, init_tracing, plan_input, with_timeout,
};

async fn call(app: &App, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = build_router(app.clone())
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

fn run_id(body: &Value) -> RunId {
    body["run_id"].as_str().unwrap().parse().unwrap()
}

fn two_step() -> Value {
    plan_input(
        "api",
        vec![
            TaskSpecBuilder::new("fetch").build(),
            TaskSpecBuilder::new("render").after("fetch").build(),
        ],
    )
}

async fn create(app: &App, session: &str, input: Value) -> RunId {
    let (status, body) = call(
        app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": session, "input": input })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["status"], "queued");
    run_id(&body)
}

#[tokio::test]
async fn health_responds() {
    let app = AppBuilder::new().build(Arc::new(ScriptedExecutor::new()));
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn created_run_completes_and_exposes_its_events() {
    init_tracing();

    let app = AppBuilder::new().build(Arc::new(ScriptedExecutor::new()));
    let id = create(&app, "web", two_step()).await;
    with_timeout(app.runs.wait_idle(id)).await.unwrap();

    let (status, run) = call(&app, Method::GET, &format!("/runs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "completed");
    assert_eq!(run["session_id"], "web");
    assert_eq!(run["output"]["results"]["fetch"]["key"], "fetch");

    let (_, events) = call(&app, Method::GET, &format!("/runs/{id}/events"), None).await;
    let events = events.as_array().unwrap();
    assert_eq!(events[0]["type"], "run_queued");
    assert_eq!(events.last().unwrap()["type"], "run_completed");
    let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let (_, page) = call(
        &app,
        Method::GET,
        &format!("/runs/{id}/events?since_seq=2&limit=3"),
        None,
    )
    .await;
    let page = page.as_array().unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(page[0]["seq"], 3);

    let (_, listed) = call(&app, Method::GET, "/runs?session_id=web", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, session) = call(&app, Method::GET, "/sessions/web/events", None).await;
    assert_eq!(session.as_array().unwrap().len(), events.len());
}

#[tokio::test]
async fn bad_requests_and_unknown_runs() {
    let app = AppBuilder::new().build(Arc::new(ScriptedExecutor::new()));

    let (status, body) = call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": " ", "input": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let missing = uuid::Uuid::new_v4();
    for uri in [
        format!("/runs/{missing}"),
        format!("/runs/{missing}/events"),
        format!("/plans/{missing}"),
    ] {
        let (status, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"]["code"], "not_found");
    }

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/runs/{missing}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resume_flow_over_http() {
    init_tracing();

    let executor = Arc::new(
        ScriptedExecutor::new().script("fetch", [TaskOutcome::NeedsInput("which url?".into())]),
    );
    let app = AppBuilder::new().build(executor);

    let id = create(&app, "resume", two_step()).await;
    with_timeout(app.runs.wait_idle(id)).await.unwrap();

    let (_, run) = call(&app, Method::GET, &format!("/runs/{id}"), None).await;
    assert_eq!(run["status"], "waiting_input");
    assert_eq!(run["waiting_reason"], "which url?");

    let (status, run) = call(
        &app,
        Method::POST,
        &format!("/runs/{id}/resume"),
        Some(json!({ "resume_payload": "https://example.org" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "running");
    assert_eq!(run["id"], id.to_string());

    let done = with_timeout(app.runs.wait_idle(id)).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/runs/{id}/resume"),
        Some(json!({ "resume_payload": "again" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "state_conflict");
}

#[tokio::test]
async fn cancel_reports_pending_then_settled() {
    init_tracing();

    let executor = Arc::new(ScriptedExecutor::new());
    let gate = executor.gate("fetch");
    let app = AppBuilder::new().build(executor);

    let id = create(&app, "cancel", two_step()).await;

    let (status, run) = call(&app, Method::POST, &format!("/runs/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(run["status"], "running");

    gate.add_permits(1);
    with_timeout(app.runs.wait_idle(id)).await.unwrap();

    let (status, run) = call(&app, Method::POST, &format!("/runs/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "cancelled");

    let (status, retry) = call(&app, Method::POST, &format!("/runs/{id}/retry"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(retry["parent_run_id"], id.to_string());
    assert_eq!(retry["status"], "queued");
    let retry_id = run_id(&retry);
    gate.add_permits(1);
    let done = with_timeout(app.runs.wait_idle(retry_id)).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
}

#[tokio::test]
async fn plan_decisions_over_http() {
    init_tracing();

    let executor = Arc::new(
        ScriptedExecutor::new().script("fetch", [TaskOutcome::Failure(TaskError::logic("404"))]),
    );
    let app = AppBuilder::new().build(executor);

    let id = create(&app, "decide", two_step()).await;
    with_timeout(app.runs.wait_idle(id)).await.unwrap();

    let plan = app.store.plans_for_session("decide").remove(0);
    let fetch = app.store.task_by_key(&plan.id, "fetch").unwrap();
    let render = app.store.task_by_key(&plan.id, "render").unwrap();

    let (status, view) = call(&app, Method::GET, &format!("/plans/{}", plan.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["plan"]["status"], "failed");
    assert_eq!(view["summary"]["blocked"], 1);
    assert_eq!(view["running"], false);

    let uri = format!("/plans/{}/decisions", plan.id);
    let (status, _) = call(&app, Method::POST, &uri, Some(json!({ "action": "skip" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let stranger = uuid::Uuid::new_v4();
    let (status, _) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "action": "skip", "task_id": stranger })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "action": "retry", "task_id": render.id })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "state_conflict");

    let (status, view) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "action": "retry", "task_id": fetch.id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["summary"]["pending"], 2);

    let (status, view) = call(&app, Method::POST, &uri, Some(json!({ "action": "abort" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["plan"]["status"], "aborted");
    assert_eq!(view["summary"]["failed"], 2);
}

#[tokio::test]
async fn deleting_a_session_drops_plans_and_history() {
    init_tracing();

    let app = AppBuilder::new().build(Arc::new(ScriptedExecutor::new()));
    let id = create(&app, "gone", two_step()).await;
    with_timeout(app.runs.wait_idle(id)).await.unwrap();

    let (status, body) = call(&app, Method::DELETE, "/sessions/gone", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "plans_deleted": 1, "events_deleted": true }));

    let (_, events) = call(&app, Method::GET, "/sessions/gone/events", None).await;
    assert_eq!(events, json!([]));
}

#[tokio::test]
async fn event_stream_replays_history_as_sse() {
    init_tracing();

    let app = AppBuilder::new().build(Arc::new(ScriptedExecutor::new()));
    let id = create(&app, "sse", two_step()).await;
    with_timeout(app.runs.wait_idle(id)).await.unwrap();

    let response = build_router(app.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{id}/events/stream"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let mut body = response.into_body().into_data_stream();
    let first = with_timeout(body.next()).await.unwrap().unwrap();
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: run_queued"), "{text}");
    assert!(text.contains("id: 1"), "{text}");
}
