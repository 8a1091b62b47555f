//! Session orchestrator
//!
//! Owns every live session. `submit` persists the session and its inputs,
//! then drains the images on a background task with at most `max_workers`
//! images in flight. CPU-bound steps of every session share one process-wide
//! pool of worker permits, sized from the active preset's `max_workers` at
//! startup; later preset changes only alter per-session image parallelism.
//! All session mutation goes through the tracker lock and
//! the `Session` methods, and every recorded item is persisted before the
//! matching progress event is emitted.
//!
//! A session ends COMPLETED once every image is processed, whatever the
//! individual outcomes. It ends ERROR only on orchestrator faults: candidate
//! resolution failing, session state that cannot be persisted, or a worker
//! task aborting.

use async_trait::async_trait;
use chrono::Utc;
use coverid_common::events::{CoverEvent, EventBus, SessionSnapshot, SessionState, StartedBy};
use coverid_common::{Error, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

use crate::db;
use crate::db::inputs::SubmittedImage;
use crate::models::preset::validate_threshold;
use crate::models::{
    Candidate, CandidateTarget, ConfigPreset, EvaluationStats, ImageItem, ItemOutcome, ItemStage,
    Session,
};
use crate::pipeline::{CandidateSource, MatchingPipeline, QueryImage};
use crate::services::broadcaster::SnapshotSource;
use crate::services::presets::PresetStore;

/// Per-submission overrides of the preset
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Preset name; the active preset when absent
    pub preset: Option<String>,
    pub similarity_threshold: Option<f64>,
    pub result_batch: Option<usize>,
}

/// Final (or in-progress) per-image results of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionResults {
    pub session: SessionSnapshot,
    pub preset_name: String,
    pub similarity_threshold: f64,
    pub best_similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationStats>,
    pub items: Vec<ImageItem>,
}

impl SessionResults {
    fn from_session(session: &Session) -> Self {
        Self {
            session: session.snapshot(),
            preset_name: session.preset_name.clone(),
            similarity_threshold: session.preset.similarity_threshold,
            best_similarity: session.best_similarity,
            evaluation: session.evaluation.clone(),
            items: session.items.clone(),
        }
    }
}

struct NewSession {
    images: Vec<SubmittedImage>,
    target: CandidateTarget,
    preset_name: String,
    preset: ConfigPreset,
    started_by: StartedBy,
    evaluation_group: Option<String>,
    replay_of: Option<Uuid>,
}

/// Live session guarded by a lock
struct SessionTracker {
    session: Mutex<Session>,
}

impl SessionTracker {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SessionOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    pipeline: Arc<MatchingPipeline>,
    presets: Arc<PresetStore>,
    candidates: Arc<dyn CandidateSource>,
    /// Blocking-pool permits shared by all sessions
    cpu: Arc<Semaphore>,
    cpu_workers: usize,
    active: Mutex<HashMap<Uuid, Arc<SessionTracker>>>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl SessionOrchestrator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        pipeline: Arc<MatchingPipeline>,
        presets: Arc<PresetStore>,
        candidates: Arc<dyn CandidateSource>,
        cpu_workers: usize,
        last_error: Arc<RwLock<Option<String>>>,
    ) -> Self {
        let cpu_workers = cpu_workers.max(1);
        Self {
            db,
            event_bus,
            pipeline,
            presets,
            candidates,
            cpu: Arc::new(Semaphore::new(cpu_workers)),
            cpu_workers,
            active: Mutex::new(HashMap::new()),
            last_error,
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<SessionTracker>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sessions currently queued or processing in this process
    pub fn active_sessions(&self) -> usize {
        self.active().len()
    }

    /// True while a worker in this process still owns the session
    pub fn is_live(&self, session_id: Uuid) -> bool {
        self.active().contains_key(&session_id)
    }

    /// Size of the shared CPU worker pool
    pub fn cpu_workers(&self) -> usize {
        self.cpu_workers
    }

    fn tracker(&self, session_id: Uuid) -> Option<Arc<SessionTracker>> {
        self.active().get(&session_id).cloned()
    }

    /// Accept a batch of images; processing continues in the background
    pub async fn submit(
        self: &Arc<Self>,
        images: Vec<SubmittedImage>,
        target: CandidateTarget,
        options: SubmitOptions,
    ) -> Result<Uuid> {
        let (preset_name, preset) = self.effective_preset(&options).await?;
        self.launch(NewSession {
            images,
            target,
            preset_name,
            preset,
            started_by: StartedBy::Manual,
            evaluation_group: None,
            replay_of: None,
        })
        .await
    }

    /// Submit a named group and compute aggregate statistics when it finishes
    pub async fn evaluate(
        self: &Arc<Self>,
        group: &str,
        images: Vec<SubmittedImage>,
        target: CandidateTarget,
        options: SubmitOptions,
    ) -> Result<Uuid> {
        let group = group.trim();
        if group.is_empty() {
            return Err(Error::InvalidInput("Evaluation group name must not be empty".to_string()));
        }
        let (preset_name, preset) = self.effective_preset(&options).await?;
        self.launch(NewSession {
            images,
            target,
            preset_name,
            preset,
            started_by: StartedBy::Automatic,
            evaluation_group: Some(group.to_string()),
            replay_of: None,
        })
        .await
    }

    /// Re-run the stored inputs of `session_id` as a new linked session
    ///
    /// The replay keeps the original preset snapshot and target.
    pub async fn replay(self: &Arc<Self>, session_id: Uuid) -> Result<Uuid> {
        let original = self.load_session(session_id).await?;
        let images = db::inputs::load_inputs(&self.db, session_id).await?;
        if images.is_empty() {
            return Err(Error::NotFound(format!("Stored inputs of session {}", session_id)));
        }

        let replay_id = self
            .launch(NewSession {
                images,
                target: original.target.clone(),
                preset_name: original.preset_name.clone(),
                preset: original.preset.clone(),
                started_by: StartedBy::Replay,
                evaluation_group: original.evaluation_group.clone(),
                replay_of: Some(session_id),
            })
            .await?;

        let updated = match self.tracker(session_id) {
            Some(tracker) => {
                let mut session = tracker.lock();
                session.mark_replayed(replay_id);
                session.clone()
            }
            None => {
                let mut session = original;
                session.mark_replayed(replay_id);
                session
            }
        };
        db::sessions::save_session(&self.db, &updated).await?;
        tracing::info!(
            session_id = %session_id,
            replay_id = %replay_id,
            "Session replayed"
        );
        Ok(replay_id)
    }

    /// Current snapshot, live or from the durable store
    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionSnapshot> {
        if let Some(tracker) = self.tracker(session_id) {
            return Ok(tracker.lock().snapshot());
        }
        Ok(self.load_session(session_id).await?.snapshot())
    }

    /// Per-image results (partial while the session is running)
    pub async fn get_results(&self, session_id: Uuid) -> Result<SessionResults> {
        if let Some(tracker) = self.tracker(session_id) {
            return Ok(SessionResults::from_session(&tracker.lock()));
        }
        let mut session = self.load_session(session_id).await?;
        session.items = db::items::load_items(&self.db, session_id).await?;
        Ok(SessionResults::from_session(&session))
    }

    /// Most recent sessions, newest first
    ///
    /// With `stale_only`, every unfinished session that is stale, regardless
    /// of `limit`.
    pub async fn list_sessions(&self, limit: usize, stale_only: bool) -> Result<Vec<SessionSnapshot>> {
        let stored = if stale_only {
            db::sessions::list_unfinished_sessions(&self.db).await?
        } else {
            db::sessions::list_sessions(&self.db, limit).await?
        };

        let snapshots = stored
            .iter()
            .map(|session| match self.tracker(session.session_id) {
                Some(tracker) => tracker.lock().snapshot(),
                None => session.snapshot(),
            })
            .filter(|snapshot| !stale_only || snapshot.is_stale)
            .collect();
        Ok(snapshots)
    }

    /// Report sessions a previous process left unfinished
    ///
    /// They stay queryable; the stale monitor flags them once they age.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let orphans = db::sessions::list_unfinished_sessions(&self.db).await?;
        for session in &orphans {
            tracing::warn!(
                session_id = %session.session_id,
                state = session.state.as_str(),
                processed = session.processed_items,
                total = session.total_items,
                "Session left unfinished by a previous run"
            );
        }
        Ok(orphans.len())
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Session> {
        db::sessions::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Session {}", session_id)))
    }

    async fn effective_preset(&self, options: &SubmitOptions) -> Result<(String, ConfigPreset)> {
        let (name, mut preset) = self.presets.resolve(options.preset.as_deref()).await?;
        if let Some(threshold) = options.similarity_threshold {
            validate_threshold(threshold)?;
            preset.similarity_threshold = threshold;
        }
        if let Some(batch) = options.result_batch {
            preset.result_batch = batch;
        }
        preset.validate()?;
        Ok((name, preset))
    }

    async fn launch(self: &Arc<Self>, request: NewSession) -> Result<Uuid> {
        if request.images.is_empty() {
            return Err(Error::InvalidInput("Submission contains no images".to_string()));
        }

        let items = request
            .images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                ImageItem::new(
                    index,
                    image.name.clone(),
                    crate::cache::fingerprint::content_fingerprint(&image.bytes),
                )
            })
            .collect();
        let mut session = Session::new(
            request.started_by,
            request.preset_name,
            request.preset,
            request.target,
            items,
        );
        session.evaluation_group = request.evaluation_group;
        session.replay_of = request.replay_of;
        let session_id = session.session_id;

        db::sessions::save_session(&self.db, &session).await?;
        db::inputs::save_inputs(&self.db, session_id, &request.images).await?;
        db::items::save_items(&self.db, session_id, &session.items).await?;

        let queries: Vec<(usize, QueryImage)> = request
            .images
            .into_iter()
            .enumerate()
            .map(|(index, image)| (index, QueryImage::new(Arc::new(image.bytes))))
            .collect();

        tracing::info!(
            session_id = %session_id,
            started_by = session.started_by.as_str(),
            images = session.total_items,
            preset = %session.preset_name,
            target = %session.target.describe(),
            "Session queued"
        );
        self.event_bus.emit_lossy(CoverEvent::SessionStarted {
            snapshot: session.snapshot(),
            timestamp: Utc::now(),
        });

        let tracker = Arc::new(SessionTracker {
            session: Mutex::new(session),
        });
        self.active().insert(session_id, tracker.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn(this.clone().run_session(tracker.clone(), queries));
            if let Err(e) = worker.await {
                this.fail_session(&tracker, format!("Session worker aborted: {}", e))
                    .await;
            }
        });

        Ok(session_id)
    }

    async fn run_session(self: Arc<Self>, tracker: Arc<SessionTracker>, queries: Vec<(usize, QueryImage)>) {
        let (session_id, preset, target) = {
            let session = tracker.lock();
            (session.session_id, session.preset.clone(), session.target.clone())
        };

        let candidates = match self.candidates.resolve(&target).await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.fail_session(&tracker, format!("Candidate resolution failed: {}", e))
                    .await;
                return;
            }
        };

        let processing = {
            let mut session = tracker.lock();
            session.mark_processing();
            let message = format!(
                "Matching {} images against {} candidates",
                session.total_items,
                candidates.len()
            );
            session.set_stage(ItemStage::Extracting.as_str(), message);
            session.clone()
        };
        if let Err(e) = db::sessions::save_session(&self.db, &processing).await {
            self.fail_session(&tracker, format!("Failed to persist session state: {}", e))
                .await;
            return;
        }
        self.emit_progress(processing.snapshot());
        tracing::info!(session_id = %session_id, candidates = candidates.len(), "Session processing");

        let workers = preset.max_workers.max(1);
        let (this, tracker_ref, preset_ref, cpu_ref) = (&*self, &*tracker, &preset, &*self.cpu);
        let candidates_ref = candidates.as_slice();
        stream::iter(queries)
            .for_each_concurrent(workers, |(index, query)| async move {
                let outcome = this
                    .match_image(tracker_ref, index, &query, preset_ref, candidates_ref, cpu_ref)
                    .await;
                this.record(tracker_ref, index, outcome).await;
            })
            .await;

        self.complete(&tracker).await;
    }

    async fn match_image(
        &self,
        tracker: &SessionTracker,
        index: usize,
        query: &QueryImage,
        preset: &ConfigPreset,
        candidates: &[Candidate],
        cpu: &Semaphore,
    ) -> ItemOutcome {
        if tracker.lock().is_terminal() {
            return ItemOutcome::failed("Session already finished");
        }
        // Cheap format sniff; undecodable input never enters the pipeline
        if image::guess_format(&query.bytes).is_err() {
            return ItemOutcome::failed("Unrecognized image format");
        }

        self.pipeline
            .process_item(query, preset, candidates, cpu, |stage| {
                let snapshot = {
                    let mut session = tracker.lock();
                    session.set_item_stage(index, stage);
                    session.set_stage(stage.as_str(), format!("Image {} {}", index + 1, stage.as_str()));
                    session.snapshot()
                };
                self.emit_progress(snapshot);
            })
            .await
    }

    async fn record(&self, tracker: &SessionTracker, index: usize, outcome: ItemOutcome) {
        let failure = outcome.error.clone();
        let (session, item) = {
            let mut session = tracker.lock();
            if !session.record_item(index, outcome) {
                return;
            }
            let item = session.items[index].clone();
            (session.clone(), item)
        };

        if let Some(error) = failure {
            tracing::warn!(session_id = %session.session_id, item = index, error = %error, "Image failed");
        } else {
            tracing::debug!(session_id = %session.session_id, item = index, "Image matched");
        }

        let persisted = async {
            db::items::save_item(&self.db, session.session_id, &item).await?;
            db::sessions::save_session(&self.db, &session).await
        };
        match persisted.await {
            Ok(()) => self.emit_progress(session.snapshot()),
            Err(e) => {
                self.fail_session(tracker, format!("Failed to persist session state: {}", e))
                    .await
            }
        }
    }

    /// COMPLETED once the terminal state is durable; ERROR if it cannot be
    async fn complete(&self, tracker: &SessionTracker) {
        let finished_at = Utc::now();
        let mut finished = {
            let session = tracker.lock();
            if !session.all_items_processed() {
                return;
            }
            session.clone()
        };
        if !finished.finish(SessionState::Completed, None, finished_at) {
            return;
        }

        if let Err(e) = db::sessions::save_session(&self.db, &finished).await {
            self.fail_session(tracker, format!("Failed to persist completion: {}", e))
                .await;
            return;
        }

        let completed = {
            let mut session = tracker.lock();
            if !session.finish(SessionState::Completed, None, finished_at) {
                return;
            }
            session.clone()
        };
        // Align the row with the in-memory timestamps; the state is already durable
        if let Err(e) = db::sessions::save_session(&self.db, &completed).await {
            tracing::warn!(session_id = %completed.session_id, error = %e, "Failed to refresh completed session row");
        }

        tracing::info!(
            session_id = %completed.session_id,
            successful = completed.successful_items,
            failed = completed.failed_items,
            best_similarity = ?completed.best_similarity,
            "Session completed"
        );
        self.active().remove(&completed.session_id);
        self.event_bus.emit_lossy(CoverEvent::SessionCompleted {
            snapshot: completed.snapshot(),
            timestamp: Utc::now(),
        });
    }

    async fn fail_session(&self, tracker: &SessionTracker, message: String) {
        let failed = {
            let mut session = tracker.lock();
            if !session.finish(SessionState::Error, Some(message.clone()), Utc::now()) {
                return;
            }
            session.clone()
        };
        tracing::error!(session_id = %failed.session_id, error = %message, "Session failed");
        *self.last_error.write().await = Some(message.clone());

        if let Err(e) = db::sessions::save_session(&self.db, &failed).await {
            tracing::error!(session_id = %failed.session_id, error = %e, "Failed to persist session error state");
        }
        self.active().remove(&failed.session_id);
        self.event_bus.emit_lossy(CoverEvent::SessionFailed {
            snapshot: failed.snapshot(),
            error: message,
            timestamp: Utc::now(),
        });
    }

    fn emit_progress(&self, snapshot: SessionSnapshot) {
        self.event_bus.emit_lossy(CoverEvent::SessionProgress {
            snapshot,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl SnapshotSource for SessionOrchestrator {
    async fn snapshot(&self, session_id: Uuid) -> Result<SessionSnapshot> {
        self.get_session(session_id).await
    }
}
