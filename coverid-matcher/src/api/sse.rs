//! Server-Sent Events endpoints
//!
//! GET /sessions/:id/events follows one session (snapshot events plus
//! comment heartbeats, closed after the terminal snapshot).
//! GET /events forwards every event on the bus.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use coverid_common::sse::{create_event_sse_stream, HEARTBEAT_COMMENT};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::ProgressMessage;
use crate::{ApiResult, AppState};

/// SSE event name carrying a `SessionSnapshot`
pub const SNAPSHOT_EVENT: &str = "SessionSnapshot";

fn to_event(message: ProgressMessage) -> Option<Event> {
    match message {
        ProgressMessage::Heartbeat => Some(Event::default().comment(HEARTBEAT_COMMENT)),
        ProgressMessage::Snapshot(snapshot) => {
            match Event::default().event(SNAPSHOT_EVENT).json_data(&snapshot) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("SSE: Failed to serialize snapshot: {}", e);
                    None
                }
            }
        }
    }
}

/// GET /sessions/:id/events
pub async fn session_event_stream(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let updates = state.broadcaster.subscribe(session_id).await?;
    info!(session_id = %session_id, "New SSE client following session");

    let stream = updates.filter_map(|message| async move { to_event(message).map(Ok) });
    Ok(Sse::new(stream))
}

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    create_event_sse_stream(&state.event_bus, state.config.heartbeat)
}

pub fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(event_stream))
        .route("/sessions/:id/events", get(session_event_stream))
}
