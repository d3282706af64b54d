// src/api/sse.rs

//! Server-Sent Events stream of a run's events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::error::ApiResult;
use crate::api::routes::EventsQuery;
use crate::app::App;
use crate::events::Event;
use crate::types::RunId;

/// GET /runs/{run_id}/events/stream?since_seq=
///
/// Replays the run's events after `since_seq`, then follows live appends.
/// Each SSE message carries the event's `seq` as its id and its type as the
/// SSE event name, so clients can reconnect with `since_seq` = last id.
pub async fn run_event_stream(
    State(app): State<App>,
    Path(run_id): Path<RunId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let run = app.runs.get(run_id)?;
    let filter = query.filter().for_run(run_id);
    debug!(run_id = %run_id, since_seq = filter.since_seq, "sse client connected");

    let stream = app
        .events
        .subscribe_from(&run.session_id, filter)
        .into_stream()
        .filter_map(|event| async move { to_sse(&event).map(Ok) });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn to_sse(event: &Event) -> Option<SseEvent> {
    match serde_json::to_string(event) {
        Ok(json) => Some(
            SseEvent::default()
                .id(event.seq.to_string())
                .event(event.type_name())
                .data(json),
        ),
        Err(e) => {
            warn!(seq = event.seq, error = %e, "failed to encode event for sse");
            None
        }
    }
}
