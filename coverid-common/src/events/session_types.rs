//! Session progress type definitions
//!
//! Supporting types carried by session events and returned by the
//! progress query surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a recognition session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// Accepted, no worker has picked it up yet
    Queued,
    /// At least one image is being processed
    Processing,
    /// No work pending (individual images may still have failed)
    Completed,
    /// Orchestrator-level fault
    Error,
    /// Superseded by a replay session
    Replayed,
}

impl SessionState {
    /// Terminal states never transition back to QUEUED/PROCESSING
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Error | SessionState::Replayed
        )
    }

    /// Stable string form used for persistence
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Queued => "QUEUED",
            SessionState::Processing => "PROCESSING",
            SessionState::Completed => "COMPLETED",
            SessionState::Error => "ERROR",
            SessionState::Replayed => "REPLAYED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(SessionState::Queued),
            "PROCESSING" => Some(SessionState::Processing),
            "COMPLETED" => Some(SessionState::Completed),
            "ERROR" => Some(SessionState::Error),
            "REPLAYED" => Some(SessionState::Replayed),
            _ => None,
        }
    }
}

/// Who started a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StartedBy {
    /// Submitted by a user
    Manual,
    /// Submitted by a scheduled/bulk process
    Automatic,
    /// Re-run of an earlier session's inputs
    Replay,
}

impl StartedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            StartedBy::Manual => "MANUAL",
            StartedBy::Automatic => "AUTOMATIC",
            StartedBy::Replay => "REPLAY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MANUAL" => Some(StartedBy::Manual),
            "AUTOMATIC" => Some(StartedBy::Automatic),
            "REPLAY" => Some(StartedBy::Replay),
            _ => None,
        }
    }
}

/// Point-in-time view of a session, as delivered to pollers and streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_by: StartedBy,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    /// 0-100, `round(100 * processed / total)`
    pub percentage_complete: u8,
    pub current_stage: String,
    pub status_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_by: Option<Uuid>,
    pub time_started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_finished: Option<DateTime<Utc>>,
    /// Advisory: PROCESSING and not updated recently
    pub is_stale: bool,
    /// Increases with every change; orders snapshots of one session
    #[serde(default)]
    pub revision: i64,
}

impl SessionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
