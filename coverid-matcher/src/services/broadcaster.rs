//! Per-session progress streams
//!
//! A subscription first yields the current snapshot, then follows the
//! session's progress events until a terminal snapshot, which closes the
//! stream. Heartbeats are a separate message kind so consumers never mistake
//! them for progress. Delivery is best effort: after a lag the stream
//! re-polls the authoritative snapshot instead of replaying missed events.

use async_trait::async_trait;
use coverid_common::events::{EventBus, SessionSnapshot};
use coverid_common::Result;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Authoritative snapshot lookup
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, session_id: Uuid) -> Result<SessionSnapshot>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMessage {
    Snapshot(SessionSnapshot),
    Heartbeat,
}

#[derive(Clone)]
pub struct ProgressBroadcaster {
    event_bus: EventBus,
    source: Arc<dyn SnapshotSource>,
    heartbeat: Duration,
}

impl ProgressBroadcaster {
    pub fn new(event_bus: EventBus, source: Arc<dyn SnapshotSource>, heartbeat: Duration) -> Self {
        Self {
            event_bus,
            source,
            heartbeat,
        }
    }

    /// Follow one session; `NotFound` if it does not exist
    pub async fn subscribe(&self, session_id: Uuid) -> Result<BoxStream<'static, ProgressMessage>> {
        // Subscribe before reading the snapshot so no update falls in between
        let mut rx = self.event_bus.subscribe();
        let current = self.source.snapshot(session_id).await?;
        let source = self.source.clone();
        let heartbeat = self.heartbeat;

        let stream = async_stream::stream! {
            let mut last_revision = current.revision;
            let finished = current.state.is_terminal();
            yield ProgressMessage::Snapshot(current);
            if finished {
                return;
            }

            let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        yield ProgressMessage::Heartbeat;
                    }
                    received = rx.recv() => {
                        let snapshot = match received {
                            Ok(event) => match event.snapshot() {
                                Some(s) if s.session_id == session_id => s.clone(),
                                _ => continue,
                            },
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::debug!(session_id = %session_id, skipped, "Progress subscriber lagged, re-polling");
                                match source.snapshot(session_id).await {
                                    Ok(s) => s,
                                    Err(e) => {
                                        tracing::warn!(session_id = %session_id, error = %e, "Re-poll failed");
                                        continue;
                                    }
                                }
                            }
                            Err(RecvError::Closed) => break,
                        };

                        // Events from concurrent workers may arrive out of order
                        if snapshot.revision <= last_revision {
                            continue;
                        }
                        last_revision = snapshot.revision;
                        let finished = snapshot.state.is_terminal();
                        yield ProgressMessage::Snapshot(snapshot);
                        if finished {
                            break;
                        }
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
