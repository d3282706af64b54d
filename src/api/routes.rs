// src/api/routes.rs

//! HTTP route handlers for the run control API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::sse;
use crate::app::App;
use crate::dag::{Plan, PlanSummary, Task};
use crate::engine::{PlanDecision, apply_decision};
use crate::events::{Event, ReadFilter};
use crate::runs::{CancelOutcome, Run, RunStatus, TriggerSource};
use crate::types::{PlanId, RunId, SessionId, TaskId};

/// Build the API router.
pub fn api_router() -> Router<App> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/resume", post(resume_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/retry", post(retry_run))
        .route("/runs/{run_id}/events", get(run_events))
        .route("/runs/{run_id}/events/stream", get(sse::run_event_stream))
        .route("/plans/{plan_id}", get(get_plan))
        .route("/plans/{plan_id}/decisions", post(decide))
        .route("/sessions/{session_id}", delete(delete_session))
        .route("/sessions/{session_id}/events", get(session_events))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    session_id: SessionId,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: RunId,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_run_id: Option<RunId>,
}

/// POST /runs - queue a run and start it.
///
/// Answers with the `queued` snapshot; progress is read from the run or its
/// events.
async fn create_run(
    State(app): State<App>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    if req.session_id.trim().is_empty() {
        return Err(ApiError::bad_request("session_id must not be empty"));
    }

    let run = app
        .runs
        .create_run(req.session_id, req.input, TriggerSource::UserMessage, None)?;
    app.runs.start(run.id)?;
    info!(run_id = %run.id, "run accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: run.id,
            status: run.status,
            parent_run_id: None,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    session_id: Option<SessionId>,
}

/// GET /runs - list runs, optionally of one session.
async fn list_runs(State(app): State<App>, Query(query): Query<ListRunsQuery>) -> Json<Vec<Run>> {
    Json(app.runs.list(query.session_id.as_deref()))
}

/// GET /runs/{run_id}
async fn get_run(State(app): State<App>, Path(run_id): Path<RunId>) -> ApiResult<Json<Run>> {
    Ok(Json(app.runs.get(run_id)?))
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    resume_payload: Value,
}

/// POST /runs/{run_id}/resume - continue a `waiting_input` run.
async fn resume_run(
    State(app): State<App>,
    Path(run_id): Path<RunId>,
    Json(req): Json<ResumeRequest>,
) -> ApiResult<Json<Run>> {
    Ok(Json(app.runs.resume(run_id, req.resume_payload)?))
}

/// POST /runs/{run_id}/cancel - 200 when settled, 202 while the driver winds down.
async fn cancel_run(
    State(app): State<App>,
    Path(run_id): Path<RunId>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    Ok(match app.runs.cancel(run_id)? {
        CancelOutcome::AlreadyTerminal(run) | CancelOutcome::Cancelled(run) => {
            (StatusCode::OK, Json(run))
        }
        CancelOutcome::Pending(run) => (StatusCode::ACCEPTED, Json(run)),
    })
}

/// POST /runs/{run_id}/retry - start a new run with the same input.
async fn retry_run(
    State(app): State<App>,
    Path(run_id): Path<RunId>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let run = app.runs.retry_run(run_id)?;
    app.runs.start(run.id)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: run.id,
            status: run.status,
            parent_run_id: run.parent_run_id,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    pub since_seq: u64,
    pub limit: Option<usize>,
}

impl EventsQuery {
    pub(crate) fn filter(&self) -> ReadFilter {
        ReadFilter {
            since_seq: self.since_seq,
            run_id: None,
            limit: self.limit,
        }
    }
}

/// GET /runs/{run_id}/events - the run's events in `seq` order.
async fn run_events(
    State(app): State<App>,
    Path(run_id): Path<RunId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let run = app.runs.get(run_id)?;
    let filter = query.filter().for_run(run_id);
    Ok(Json(app.events.read(&run.session_id, &filter)))
}

/// GET /sessions/{session_id}/events - every event of the session.
async fn session_events(
    State(app): State<App>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<Event>> {
    Json(app.events.read(&session_id, &query.filter()))
}

#[derive(Debug, Serialize)]
struct SessionDeleted {
    plans_deleted: usize,
    events_deleted: bool,
}

/// DELETE /sessions/{session_id} - drop the session's plans and event history.
async fn delete_session(
    State(app): State<App>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<SessionDeleted>> {
    let plans_deleted = app.store.delete_session(&session_id);
    let events_deleted = app.events.delete_session(&session_id)?;
    Ok(Json(SessionDeleted {
        plans_deleted,
        events_deleted,
    }))
}

#[derive(Debug, Serialize)]
struct PlanView {
    plan: Plan,
    tasks: Vec<Task>,
    summary: PlanSummary,
    /// An execution is attached and accepts decisions live.
    running: bool,
}

/// GET /plans/{plan_id}
async fn get_plan(State(app): State<App>, Path(plan_id): Path<PlanId>) -> ApiResult<Json<PlanView>> {
    plan_view(&app, plan_id).map(Json)
}

fn plan_view(app: &App, plan_id: PlanId) -> ApiResult<PlanView> {
    Ok(PlanView {
        plan: app.store.get_plan(&plan_id)?,
        tasks: app.store.tasks_of(&plan_id)?,
        summary: app.store.plan_summary(&plan_id)?,
        running: app.registry.is_running(&plan_id),
    })
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecisionAction {
    Skip,
    Retry,
    Abort,
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    action: DecisionAction,
    task_id: Option<TaskId>,
}

/// POST /plans/{plan_id}/decisions - skip / retry a failed task, or abort.
async fn decide(
    State(app): State<App>,
    Path(plan_id): Path<PlanId>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Json<PlanView>> {
    let task_of_plan = |task_id: Option<TaskId>| -> ApiResult<TaskId> {
        let task_id =
            task_id.ok_or_else(|| ApiError::bad_request("task_id is required for this action"))?;
        let task = app.store.get_task(&task_id)?;
        if task.plan_id != plan_id {
            return Err(ApiError::not_found(format!(
                "task {task_id} is not part of plan {plan_id}"
            )));
        }
        Ok(task_id)
    };

    let decision = match req.action {
        DecisionAction::Skip => PlanDecision::Skip(task_of_plan(req.task_id)?),
        DecisionAction::Retry => PlanDecision::Retry(task_of_plan(req.task_id)?),
        DecisionAction::Abort => PlanDecision::Abort,
    };

    apply_decision(&app.registry, &app.store, &app.events, plan_id, decision).await?;
    info!(plan = %plan_id, ?decision, "decision applied");

    plan_view(&app, plan_id).map(Json)
}
