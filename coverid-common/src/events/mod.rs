//! Event types for the coverid event system
//!
//! Provides shared event definitions and the EventBus used by the
//! orchestrator, the configuration surface and the progress broadcaster.

mod session_types;

pub use session_types::{SessionSnapshot, SessionState, StartedBy};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// coverid event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoverEvent {
    /// Session accepted and queued
    SessionStarted {
        snapshot: SessionSnapshot,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Counters, stage or message of a session changed
    ///
    /// Triggers:
    /// - SSE: update progress bar and counts
    SessionProgress {
        snapshot: SessionSnapshot,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session finished all pending work
    SessionCompleted {
        snapshot: SessionSnapshot,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session hit an orchestrator-level fault
    SessionFailed {
        snapshot: SessionSnapshot,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Active preset or a preset body changed
    PresetChanged {
        /// Name of the active preset after the change
        active_preset: String,
        /// Name of the preset whose body changed, if any
        updated_preset: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Cache entries were removed by an operator
    CacheInvalidated {
        /// Key prefix removed ("" for the whole cache)
        prefix: String,
        removed_entries: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl CoverEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            CoverEvent::SessionStarted { .. } => "SessionStarted",
            CoverEvent::SessionProgress { .. } => "SessionProgress",
            CoverEvent::SessionCompleted { .. } => "SessionCompleted",
            CoverEvent::SessionFailed { .. } => "SessionFailed",
            CoverEvent::PresetChanged { .. } => "PresetChanged",
            CoverEvent::CacheInvalidated { .. } => "CacheInvalidated",
        }
    }

    /// Session this event belongs to, if it is a session event
    pub fn session_id(&self) -> Option<Uuid> {
        self.snapshot().map(|s| s.session_id)
    }

    /// Snapshot carried by session events
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        match self {
            CoverEvent::SessionStarted { snapshot, .. }
            | CoverEvent::SessionProgress { snapshot, .. }
            | CoverEvent::SessionCompleted { snapshot, .. }
            | CoverEvent::SessionFailed { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for application-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use coverid_common::events::{CoverEvent, EventBus};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(CoverEvent::PresetChanged {
///     active_preset: "balanced".to_string(),
///     updated_preset: None,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoverEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered per subscriber before the
    /// oldest are dropped (the subscriber then sees `RecvError::Lagged`).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<CoverEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CoverEvent,
    ) -> Result<usize, broadcast::error::SendError<CoverEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CoverEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
