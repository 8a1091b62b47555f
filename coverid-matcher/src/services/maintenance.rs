//! Background maintenance: stale session monitor and cache retention

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::FeatureCache;
use crate::services::orchestrator::SessionOrchestrator;

/// How often the durable cache is trimmed to the retention policy
pub const CACHE_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Sessions reported stale, so each one is warned about once
#[derive(Debug, Default)]
pub struct StaleTracker {
    reported: HashSet<Uuid>,
}

impl StaleTracker {
    /// Warn about newly stale sessions; returns their ids
    ///
    /// Staleness is advisory: the sessions are neither cancelled nor changed.
    pub async fn check(&mut self, orchestrator: &SessionOrchestrator) -> coverid_common::Result<Vec<Uuid>> {
        let stale = orchestrator.list_sessions(0, true).await?;
        let current: HashSet<Uuid> = stale.iter().map(|s| s.session_id).collect();

        let mut newly_stale = Vec::new();
        for snapshot in &stale {
            if self.reported.insert(snapshot.session_id) {
                warn!(
                    session_id = %snapshot.session_id,
                    last_updated = %snapshot.last_updated,
                    processed = snapshot.processed_items,
                    total = snapshot.total_items,
                    "Session is stale (no progress for over {} minutes)",
                    crate::models::session::STALE_AFTER_MINUTES
                );
                newly_stale.push(snapshot.session_id);
            }
        }
        // Forget sessions that recovered or finished
        self.reported.retain(|id| current.contains(id));
        Ok(newly_stale)
    }
}

pub fn spawn_stale_monitor(orchestrator: Arc<SessionOrchestrator>, every: Duration) -> JoinHandle<()> {
    info!("Starting stale session monitor (interval: {}s)", every.as_secs());
    tokio::spawn(async move {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tracker = StaleTracker::default();

        loop {
            timer.tick().await;
            if let Err(e) = tracker.check(&orchestrator).await {
                error!("Stale session check failed: {}", e);
            }
        }
    })
}

pub fn spawn_cache_retention(cache: Arc<FeatureCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; startup already ran retention
        timer.tick().await;

        loop {
            timer.tick().await;
            match cache.evict_expired().await {
                Ok(report) => debug!(
                    expired = report.expired,
                    trimmed = report.trimmed,
                    skipped_in_flight = report.skipped_in_flight,
                    "Periodic cache retention finished"
                ),
                Err(e) => error!("Cache retention failed: {}", e),
            }
        }
    })
}
