//! Recognition session state
//!
//! A session is one batch request: its counters, lifecycle state, the preset
//! snapshot it runs with and the per-image items it exclusively owns. All
//! mutation goes through the methods below so the counter and timestamp
//! rules hold at every observable point:
//! - `processed_items == successful_items + failed_items <= total_items`
//! - `last_updated` never moves backwards
//! - `time_finished` is set once, on the first terminal transition

use super::{CandidateTarget, ConfigPreset, EvaluationStats, ImageItem, ItemOutcome, ItemStage};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use coverid_common::events::{SessionSnapshot, SessionState, StartedBy};
use uuid::Uuid;

/// PROCESSING sessions idle for longer than this are reported stale
pub const STALE_AFTER_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_by: StartedBy,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub percentage_complete: u8,
    pub current_stage: String,
    pub status_message: String,
    pub error_message: Option<String>,
    pub evaluation_group: Option<String>,
    pub replay_of: Option<Uuid>,
    pub replayed_by: Option<Uuid>,
    pub preset_name: String,
    pub preset: ConfigPreset,
    pub target: CandidateTarget,
    pub best_similarity: Option<f64>,
    pub evaluation: Option<EvaluationStats>,
    pub items: Vec<ImageItem>,
    pub time_started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub time_finished: Option<DateTime<Utc>>,
    /// Bumped on every mutation; persistence refuses to overwrite newer rows
    pub revision: i64,
}

impl Session {
    pub fn new(
        started_by: StartedBy,
        preset_name: String,
        preset: ConfigPreset,
        target: CandidateTarget,
        items: Vec<ImageItem>,
    ) -> Self {
        let now = now();
        Self {
            session_id: Uuid::new_v4(),
            state: SessionState::Queued,
            started_by,
            total_items: items.len(),
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            percentage_complete: 0,
            current_stage: SessionState::Queued.as_str().to_string(),
            status_message: format!("Queued {} images", items.len()),
            error_message: None,
            evaluation_group: None,
            replay_of: None,
            replayed_by: None,
            preset_name,
            preset,
            target,
            best_similarity: None,
            evaluation: None,
            items,
            time_started: now,
            last_updated: now,
            time_finished: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Advance `last_updated` (never backwards) and bump the revision
    pub fn touch(&mut self) {
        let now = now();
        if now > self.last_updated {
            self.last_updated = now;
        }
        self.revision += 1;
    }

    /// QUEUED → PROCESSING; no effect in any other state
    pub fn mark_processing(&mut self) -> bool {
        if self.state != SessionState::Queued {
            return false;
        }
        self.state = SessionState::Processing;
        self.current_stage = SessionState::Processing.as_str().to_string();
        self.status_message = format!("Processing {} images", self.total_items);
        self.touch();
        true
    }

    pub fn set_stage(&mut self, stage: &str, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.current_stage = stage.to_string();
        self.status_message = message.into();
        self.touch();
    }

    pub fn set_item_stage(&mut self, index: usize, stage: ItemStage) {
        if let Some(item) = self.items.get_mut(index) {
            if !item.stage.is_terminal() {
                item.stage = stage;
            }
        }
    }

    /// Record the outcome of one image and update the counters
    ///
    /// Returns false (and changes nothing) if the item was already recorded
    /// or the session is terminal.
    pub fn record_item(&mut self, index: usize, outcome: ItemOutcome) -> bool {
        if self.is_terminal() || self.processed_items >= self.total_items {
            return false;
        }
        let Some(item) = self.items.get_mut(index) else {
            return false;
        };
        if item.stage.is_terminal() {
            return false;
        }

        let failed = outcome.is_failure();
        if let Some(best) = outcome.best_similarity {
            self.best_similarity = Some(self.best_similarity.map_or(best, |b| b.max(best)));
        }
        item.stage = if failed {
            ItemStage::Failed
        } else {
            ItemStage::Done
        };
        item.outcome = Some(outcome);

        self.processed_items += 1;
        if failed {
            self.failed_items += 1;
        } else {
            self.successful_items += 1;
        }
        self.percentage_complete = percentage(self.processed_items, self.total_items);
        self.status_message = format!(
            "{} of {} images processed",
            self.processed_items, self.total_items
        );
        self.touch();
        true
    }

    pub fn all_items_processed(&self) -> bool {
        self.processed_items == self.total_items
    }

    /// Enter a terminal state; only the first call has effect
    pub fn finish(
        &mut self,
        state: SessionState,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.state = state;
        self.current_stage = state.as_str().to_string();
        self.status_message = match state {
            SessionState::Completed => format!(
                "Completed: {} succeeded, {} failed",
                self.successful_items, self.failed_items
            ),
            _ => "Session failed".to_string(),
        };
        self.error_message = error;
        self.time_finished = Some(at.trunc_subsecs(6).max(self.last_updated));
        if let Some(group) = &self.evaluation_group {
            self.evaluation = Some(EvaluationStats::from_items(group, &self.items));
        }
        self.touch();
        true
    }

    /// Link the replay session; a finished session becomes REPLAYED
    pub fn mark_replayed(&mut self, replay_id: Uuid) {
        self.replayed_by = Some(replay_id);
        if matches!(self.state, SessionState::Completed | SessionState::Error) {
            self.state = SessionState::Replayed;
            self.current_stage = SessionState::Replayed.as_str().to_string();
        }
        self.status_message = format!("Replayed as {}", replay_id);
        self.touch();
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Processing
            && now - self.last_updated > Duration::minutes(STALE_AFTER_MINUTES)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            state: self.state,
            started_by: self.started_by,
            total_items: self.total_items,
            processed_items: self.processed_items,
            successful_items: self.successful_items,
            failed_items: self.failed_items,
            percentage_complete: self.percentage_complete,
            current_stage: self.current_stage.clone(),
            status_message: self.status_message.clone(),
            error_message: self.error_message.clone(),
            evaluation_group: self.evaluation_group.clone(),
            replay_of: self.replay_of,
            replayed_by: self.replayed_by,
            time_started: self.time_started,
            last_updated: self.last_updated,
            time_finished: self.time_finished,
            is_stale: self.is_stale(),
            revision: self.revision,
        }
    }
}

/// Current time at the microsecond precision timestamps are stored with
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// `round(100 * processed / total)`, 0 for an empty session
pub fn percentage(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((processed as f64 * 100.0 / total as f64).round() as u64).min(100) as u8
}
