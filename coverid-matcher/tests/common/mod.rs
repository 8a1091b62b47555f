//! Shared helpers for coverid-matcher integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use coverid_common::events::SessionSnapshot;
use coverid_matcher::config::ServiceConfig;
use coverid_matcher::detectors::DetectorRegistry;
use coverid_matcher::pipeline::{FetchError, ImageFetcher, InlineCandidateSource};
use coverid_matcher::{db, AppState, EngineComponents};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Fetcher for tests that never hit the network
pub struct OfflineFetcher;

#[async_trait]
impl ImageFetcher for OfflineFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Request {
            url: url.to_string(),
            message: "offline".to_string(),
        })
    }
}

/// PNG cover filled with seeded pixel noise around a seeded base color
///
/// Different seeds give visually unrelated covers.
pub fn noise_cover(seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let base: [u8; 3] = [rng.gen_range(0..128), rng.gen_range(0..128), rng.gen_range(0..128)];
    let image = RgbImage::from_fn(120, 160, |_, _| {
        Rgb([
            base[0] + rng.gen_range(0..128),
            base[1] + rng.gen_range(0..128),
            base[2] + rng.gen_range(0..128),
        ])
    });

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub struct TestEnv {
    pub dir: TempDir,
    pub state: AppState,
}

pub async fn test_state() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let state = state_at(&dir).await;
    TestEnv { dir, state }
}

/// Fresh services over the database in `dir` (simulates a restart)
pub async fn state_at(dir: &TempDir) -> AppState {
    state_with_registry(dir, DetectorRegistry::with_builtins()).await
}

/// Services over the database in `dir` using the given detectors
pub async fn state_with_registry(dir: &TempDir, registry: DetectorRegistry) -> AppState {
    let pool = db::init_database_pool(&dir.path().join(db::DATABASE_FILE_NAME))
        .await
        .unwrap();
    let config = ServiceConfig {
        root_folder: dir.path().to_path_buf(),
        heartbeat: Duration::from_millis(200),
        ..ServiceConfig::default()
    };
    let components = EngineComponents {
        registry,
        candidate_source: std::sync::Arc::new(InlineCandidateSource),
        fetcher: std::sync::Arc::new(OfflineFetcher),
    };
    AppState::build(pool, config, components).await.unwrap()
}

/// Poll until the session reaches a terminal state
pub async fn wait_until_finished(state: &AppState, session_id: Uuid) -> SessionSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let snapshot = state.orchestrator.get_session(session_id).await.unwrap();
        assert_eq!(
            snapshot.processed_items,
            snapshot.successful_items + snapshot.failed_items
        );
        assert!(snapshot.processed_items <= snapshot.total_items);
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {} did not finish",
            session_id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
