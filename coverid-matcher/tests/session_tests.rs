//! End-to-end session tests: submission, matching, evaluation, replay and
//! progress streaming against a file-backed database

mod common;

use common::{noise_cover, state_at, state_with_registry, test_state, wait_until_finished};
use coverid_common::events::{SessionState, StartedBy};
use coverid_common::Error;
use coverid_matcher::db;
use coverid_matcher::db::inputs::SubmittedImage;
use coverid_matcher::detectors::{
    DescriptorSet, Detector, DetectorError, DetectorKind, DetectorRegistry, DetectorStats,
    GridHashDetector, PreparedImage,
};
use coverid_matcher::models::{Candidate, CandidateTarget, ItemStage};
use coverid_matcher::services::{ProgressMessage, SubmitOptions};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn five_candidates() -> CandidateTarget {
    CandidateTarget::Inline {
        candidates: (1..=5)
            .map(|seed| Candidate::from_bytes(format!("cover-{}", seed), noise_cover(seed)))
            .collect(),
    }
}

fn fast() -> SubmitOptions {
    SubmitOptions {
        preset: Some("fast".to_string()),
        ..SubmitOptions::default()
    }
}

#[tokio::test]
async fn test_three_images_against_five_candidates() {
    let env = test_state().await;
    let images = vec![
        SubmittedImage::new("matches-1", noise_cover(1)),
        SubmittedImage::new("matches-3", noise_cover(3)),
        SubmittedImage::new("unknown", noise_cover(99)),
    ];

    let session_id = env
        .state
        .orchestrator
        .evaluate("folder-a", images, five_candidates(), fast())
        .await
        .unwrap();
    let snapshot = wait_until_finished(&env.state, session_id).await;

    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(snapshot.total_items, 3);
    assert_eq!(snapshot.successful_items, 3);
    assert_eq!(snapshot.failed_items, 0);
    assert_eq!(snapshot.percentage_complete, 100);
    assert!(snapshot.time_finished.is_some());

    let results = env.state.orchestrator.get_results(session_id).await.unwrap();
    let evaluation = results.evaluation.clone().unwrap();
    assert_eq!(evaluation.group, "folder-a");
    assert_eq!(evaluation.total_images, 3);
    assert_eq!(evaluation.successful_matches, 2);
    assert_eq!(evaluation.no_matches, 1);
    assert_eq!(evaluation.failed_uploads, 0);

    let observed_max = results
        .items
        .iter()
        .flat_map(|item| item.outcome.as_ref().unwrap().matches.iter())
        .map(|m| m.similarity)
        .fold(f64::MIN, f64::max);
    assert_eq!(results.best_similarity, Some(observed_max));
    assert_eq!(evaluation.best_similarity, Some(observed_max));

    for item in &results.items {
        assert_eq!(item.stage, ItemStage::Done);
        let outcome = item.outcome.as_ref().unwrap();
        assert_eq!(outcome.compared_candidates, 5);
        for pair in outcome.matches.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }
    let top = |index: usize| {
        results.items[index].outcome.as_ref().unwrap().matches[0].clone()
    };
    assert_eq!(top(0).candidate_id, "cover-1");
    assert!(top(0).meets_threshold);
    assert_eq!(top(1).candidate_id, "cover-3");
    assert!(top(1).meets_threshold);
    assert!(!results.items[2].outcome.as_ref().unwrap().match_success);
}

#[tokio::test]
async fn test_undecodable_image_fails_item_not_session() {
    let env = test_state().await;
    let images = vec![
        SubmittedImage::new("good", noise_cover(2)),
        SubmittedImage::new("corrupt", b"\x00\x01 definitely not an image".to_vec()),
    ];

    let session_id = env
        .state
        .orchestrator
        .submit(images, five_candidates(), fast())
        .await
        .unwrap();
    let snapshot = wait_until_finished(&env.state, session_id).await;

    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(snapshot.successful_items, 1);
    assert_eq!(snapshot.failed_items, 1);
    assert_eq!(snapshot.error_message, None);

    let results = env.state.orchestrator.get_results(session_id).await.unwrap();
    assert_eq!(results.items[1].stage, ItemStage::Failed);
    assert!(results.items[1].outcome.as_ref().unwrap().error.is_some());
}

#[tokio::test]
async fn test_rejects_empty_submission_and_bad_overrides() {
    let env = test_state().await;
    let orchestrator = &env.state.orchestrator;

    assert!(matches!(
        orchestrator.submit(Vec::new(), five_candidates(), fast()).await,
        Err(Error::InvalidInput(_))
    ));

    let options = SubmitOptions {
        similarity_threshold: Some(1.5),
        ..fast()
    };
    assert!(matches!(
        orchestrator
            .submit(vec![SubmittedImage::new("a", noise_cover(1))], five_candidates(), options)
            .await,
        Err(Error::InvalidInput(_))
    ));

    let options = SubmitOptions {
        preset: Some("missing".to_string()),
        ..SubmitOptions::default()
    };
    assert!(matches!(
        orchestrator
            .submit(vec![SubmittedImage::new("a", noise_cover(1))], five_candidates(), options)
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unresolvable_target_ends_session_in_error() {
    let env = test_state().await;
    let target = CandidateTarget::Series {
        series: "Saga".to_string(),
        issue_number: Some("1".to_string()),
    };

    let session_id = env
        .state
        .orchestrator
        .submit(vec![SubmittedImage::new("a", noise_cover(1))], target, fast())
        .await
        .unwrap();
    let snapshot = wait_until_finished(&env.state, session_id).await;

    assert_eq!(snapshot.state, SessionState::Error);
    assert!(snapshot.error_message.unwrap().contains("Candidate resolution failed"));
    assert!(env.state.last_error.read().await.is_some());
}

#[tokio::test]
async fn test_replay_reuses_inputs_and_links_sessions() {
    let env = test_state().await;
    let images = vec![
        SubmittedImage::new("a", noise_cover(4)),
        SubmittedImage::new("b", noise_cover(50)),
    ];
    let original_id = env
        .state
        .orchestrator
        .submit(images.clone(), five_candidates(), fast())
        .await
        .unwrap();
    wait_until_finished(&env.state, original_id).await;

    let replay_id = env.state.orchestrator.replay(original_id).await.unwrap();
    assert_ne!(replay_id, original_id);
    let replay = wait_until_finished(&env.state, replay_id).await;

    assert_eq!(replay.state, SessionState::Completed);
    assert_eq!(replay.started_by, StartedBy::Replay);
    assert_eq!(replay.replay_of, Some(original_id));

    let original = env.state.orchestrator.get_session(original_id).await.unwrap();
    assert_eq!(original.state, SessionState::Replayed);
    assert_eq!(original.started_by, StartedBy::Manual);
    assert_eq!(original.replayed_by, Some(replay_id));

    let replayed_inputs = db::inputs::load_inputs(&env.state.db, replay_id).await.unwrap();
    assert_eq!(replayed_inputs, images);

    let first = env.state.orchestrator.get_results(original_id).await.unwrap();
    let second = env.state.orchestrator.get_results(replay_id).await.unwrap();
    assert_eq!(first.best_similarity, second.best_similarity);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let env = test_state().await;
    let session_id = env
        .state
        .orchestrator
        .submit(vec![SubmittedImage::new("a", noise_cover(5))], five_candidates(), fast())
        .await
        .unwrap();
    let finished = wait_until_finished(&env.state, session_id).await;
    let results = env.state.orchestrator.get_results(session_id).await.unwrap();

    let restarted = state_at(&env.dir).await;
    let reloaded = restarted.orchestrator.get_session(session_id).await.unwrap();
    assert_eq!(reloaded.state, finished.state);
    assert_eq!(reloaded.processed_items, finished.processed_items);
    assert_eq!(reloaded.time_finished, finished.time_finished);

    let reloaded_results = restarted.orchestrator.get_results(session_id).await.unwrap();
    assert_eq!(reloaded_results.items, results.items);

    // The durable cache already holds every descriptor and comparison
    let stats = restarted.cache.stats().await.unwrap();
    assert!(stats.entry_count > 0);
    let again = restarted
        .orchestrator
        .submit(vec![SubmittedImage::new("a", noise_cover(5))], five_candidates(), fast())
        .await
        .unwrap();
    wait_until_finished(&restarted, again).await;
    let after = restarted.cache.stats().await.unwrap();
    assert_eq!(after.misses, 0);
    assert_eq!(after.entry_count, stats.entry_count);
}

#[tokio::test]
async fn test_late_subscriber_gets_single_terminal_snapshot() {
    let env = test_state().await;
    let session_id = env
        .state
        .orchestrator
        .submit(vec![SubmittedImage::new("a", noise_cover(1))], five_candidates(), fast())
        .await
        .unwrap();
    wait_until_finished(&env.state, session_id).await;

    let messages: Vec<ProgressMessage> = env
        .state
        .broadcaster
        .subscribe(session_id)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ProgressMessage::Snapshot(snapshot) => {
            assert_eq!(snapshot.state, SessionState::Completed)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_live_subscriber_sees_monotonic_progress_until_completion() {
    let env = test_state().await;
    let images = (10..16)
        .map(|seed| SubmittedImage::new(format!("img-{}", seed), noise_cover(seed)))
        .collect();
    let session_id = env
        .state
        .orchestrator
        .submit(images, five_candidates(), fast())
        .await
        .unwrap();

    let mut stream = env.state.broadcaster.subscribe(session_id).await.unwrap();
    let mut last_processed = 0;
    let mut last_state = None;
    while let Some(message) = stream.next().await {
        if let ProgressMessage::Snapshot(snapshot) = message {
            assert!(snapshot.processed_items >= last_processed);
            assert_eq!(
                snapshot.processed_items,
                snapshot.successful_items + snapshot.failed_items
            );
            last_processed = snapshot.processed_items;
            last_state = Some(snapshot.state);
        }
    }

    assert_eq!(last_state, Some(SessionState::Completed));
    assert_eq!(last_processed, 6);
}

#[tokio::test]
async fn test_stale_listing_ignores_finished_sessions() {
    let env = test_state().await;
    let session_id = env
        .state
        .orchestrator
        .submit(vec![SubmittedImage::new("a", noise_cover(1))], five_candidates(), fast())
        .await
        .unwrap();
    wait_until_finished(&env.state, session_id).await;

    let all = env.state.orchestrator.list_sessions(10, false).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(env.state.orchestrator.list_sessions(10, true).await.unwrap().is_empty());
    assert_eq!(env.state.orchestrator.recover_orphans().await.unwrap(), 0);
}

/// Grid hash that records how many comparisons run at once
#[derive(Default)]
struct CountingDetector {
    inner: GridHashDetector,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Detector for CountingDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::GridHash
    }

    fn extract(&self, image: &PreparedImage) -> Result<DescriptorSet, DetectorError> {
        self.inner.extract(image)
    }

    fn compare(
        &self,
        query: &DescriptorSet,
        candidate: &DescriptorSet,
        advanced: bool,
    ) -> Result<DetectorStats, DetectorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(15));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.compare(query, candidate, advanced)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_share_one_worker_pool() {
    let dir = TempDir::new().unwrap();
    let counting = Arc::new(CountingDetector::default());
    let mut registry = DetectorRegistry::with_builtins();
    registry.register(counting.clone());
    let state = state_with_registry(&dir, registry).await;

    // Sized by the startup preset, smaller than the per-session image fan-out
    let pool = state.orchestrator.cpu_workers();
    assert_eq!(pool, 4);

    let images = |offset: u64| -> Vec<SubmittedImage> {
        (0..6)
            .map(|i| SubmittedImage::new(format!("img-{}", offset + i), noise_cover(offset + i)))
            .collect()
    };
    let first = state
        .orchestrator
        .submit(images(10), five_candidates(), fast())
        .await
        .unwrap();
    let second = state
        .orchestrator
        .submit(images(20), five_candidates(), fast())
        .await
        .unwrap();

    for session_id in [first, second] {
        let snapshot = wait_until_finished(&state, session_id).await;
        assert_eq!(snapshot.state, SessionState::Completed);
    }

    let peak = counting.peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= pool, "{} comparisons ran at once with {} permits", peak, pool);
}
