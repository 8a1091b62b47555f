//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE plumbing: every `CoverEvent` on the bus becomes one SSE event
//! named after `CoverEvent::event_type`, with comment heartbeats in between.

use crate::events::{CoverEvent, EventBus};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Comment text used for keep-alive frames
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// Serialize an event into an SSE frame
///
/// Returns `None` (and logs) if serialization fails.
pub fn to_sse_event(event: &CoverEvent) -> Option<Event> {
    let event_type = event.event_type();
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event(event_type).data(json)),
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
            None
        }
    }
}

/// Stream every event published on `event_bus` to one SSE client
///
/// Lagging clients skip the dropped events and continue; the authoritative
/// state is always available through the polling endpoints.
pub fn create_event_sse_stream(
    event_bus: &EventBus,
    heartbeat: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to general events");
    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(frame) = to_sse_event(&event) {
                        debug!("SSE: Broadcasting event: {}", event.event_type());
                        yield Ok(frame);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE: client lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text(HEARTBEAT_COMMENT))
}
