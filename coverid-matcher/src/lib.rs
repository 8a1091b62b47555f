//! coverid-matcher library interface
//!
//! Comic cover recognition engine: matches submitted cover images against
//! candidate covers using pluggable feature detectors, a shared
//! feature/result cache and weighted score fusion, with batch sessions,
//! progress streaming and an HTTP surface.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod detectors;
pub mod error;
pub mod fusion;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use coverid_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::FeatureCache;
use crate::config::ServiceConfig;
use crate::detectors::DetectorRegistry;
use crate::pipeline::{CandidateSource, HttpImageFetcher, ImageFetcher, InlineCandidateSource, MatchingPipeline};
use crate::services::{PresetStore, ProgressBroadcaster, SessionOrchestrator};

/// Events buffered per subscriber before it lags
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Pluggable engine parts supplied by the host
pub struct EngineComponents {
    pub registry: DetectorRegistry,
    pub candidate_source: Arc<dyn CandidateSource>,
    pub fetcher: Arc<dyn ImageFetcher>,
}

impl EngineComponents {
    /// Built-in detectors, inline candidates and HTTP candidate downloads
    pub fn standard(config: &ServiceConfig) -> coverid_common::Result<Self> {
        Ok(Self {
            registry: DetectorRegistry::with_builtins(),
            candidate_source: Arc::new(InlineCandidateSource),
            fetcher: Arc::new(HttpImageFetcher::new(config.fetch_timeout)?),
        })
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub presets: Arc<PresetStore>,
    pub cache: Arc<FeatureCache>,
    pub broadcaster: ProgressBroadcaster,
    pub config: Arc<ServiceConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last orchestrator-level error, for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire the engine services on top of an initialized database
    pub async fn build(
        db: SqlitePool,
        config: ServiceConfig,
        components: EngineComponents,
    ) -> coverid_common::Result<Self> {
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let last_error = Arc::new(RwLock::new(None));

        let cache = Arc::new(FeatureCache::new(db.clone(), config.cache));
        let presets = Arc::new(PresetStore::load(db.clone(), event_bus.clone()).await?);
        let (_, startup_preset) = presets.active().await?;
        let pipeline = Arc::new(MatchingPipeline::new(
            Arc::new(components.registry),
            cache.clone(),
            components.fetcher,
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            db.clone(),
            event_bus.clone(),
            pipeline,
            presets.clone(),
            components.candidate_source,
            startup_preset.max_workers,
            last_error.clone(),
        ));
        let broadcaster =
            ProgressBroadcaster::new(event_bus.clone(), orchestrator.clone(), config.heartbeat);

        Ok(Self {
            db,
            event_bus,
            orchestrator,
            presets,
            cache,
            broadcaster,
            config: Arc::new(config),
            startup_time: Utc::now(),
            last_error,
        })
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::session_routes())
        .merge(api::event_routes())
        .merge(api::preset_routes())
        .merge(api::cache_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
