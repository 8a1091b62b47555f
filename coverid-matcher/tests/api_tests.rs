//! HTTP surface tests for coverid-matcher
//!
//! Requests go through the full router with `oneshot`; sessions run against a
//! file-backed database in a temporary directory.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use common::{noise_cover, test_state, wait_until_finished, TestEnv};
use coverid_common::events::{SessionState, StartedBy};
use coverid_matcher::build_router;
use coverid_matcher::db;
use coverid_matcher::db::inputs::SubmittedImage;
use coverid_matcher::models::{Candidate, CandidateTarget, ImageItem, Session};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

fn app(env: &TestEnv) -> Router {
    build_router(env.state.clone())
}

async fn send(env: &TestEnv, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app(env).oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn get_json(env: &TestEnv, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, body) = send(env, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn send_json(env: &TestEnv, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(env, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

fn submission(seeds: &[u64]) -> Value {
    let images: Vec<Value> = seeds
        .iter()
        .map(|seed| json!({ "name": format!("seed-{}", seed), "data": STANDARD.encode(noise_cover(*seed)) }))
        .collect();
    let candidates: Vec<Value> = (1..=3u64)
        .map(|seed| json!({ "id": format!("cover-{}", seed), "image": STANDARD.encode(noise_cover(seed)) }))
        .collect();
    json!({
        "images": images,
        "target": { "kind": "inline", "candidates": candidates },
        "preset": "fast"
    })
}

async fn submit(env: &TestEnv, seeds: &[u64]) -> Uuid {
    let (status, body) = send_json(env, "POST", "/sessions", submission(seeds)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "QUEUED");
    body["session_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = test_state().await;
    let (status, body) = get_json(&env, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "coverid-matcher");
    assert_eq!(body["active_sessions"], 0);
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_submit_then_read_session_and_results() {
    let env = test_state().await;
    let session_id = submit(&env, &[2, 77]).await;
    wait_until_finished(&env.state, session_id).await;

    let (status, session) = get_json(&env, &format!("/sessions/{}", session_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["state"], "COMPLETED");
    assert_eq!(session["total_items"], 2);
    assert_eq!(session["processed_items"], 2);

    let (status, results) = get_json(&env, &format!("/sessions/{}/results", session_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["preset_name"], "fast");
    let items = results["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["outcome"]["matches"][0]["candidate_id"], "cover-2");

    let (status, listed) = get_json(&env, "/sessions?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_evaluation_endpoint_reports_group_stats() {
    let env = test_state().await;
    let mut body = submission(&[1, 90]);
    body["group"] = json!("folder-b");

    let (status, accepted) = send_json(&env, "POST", "/evaluations", body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let session_id: Uuid = accepted["session_id"].as_str().unwrap().parse().unwrap();
    wait_until_finished(&env.state, session_id).await;

    let (_, results) = get_json(&env, &format!("/sessions/{}/results", session_id)).await;
    assert_eq!(results["evaluation"]["group"], "folder-b");
    assert_eq!(results["evaluation"]["total_images"], 2);
    assert_eq!(results["evaluation"]["successful_matches"], 1);
}

#[tokio::test]
async fn test_unknown_session_is_404_with_error_body() {
    let env = test_state().await;
    let (status, body) = get_json(&env, &format!("/sessions/{}", Uuid::new_v4())).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let request = Request::builder()
        .uri(format!("/sessions/{}/events", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&env, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_submission_is_400() {
    let env = test_state().await;
    let mut body = submission(&[]);
    body["images"] = json!([]);

    let (status, body) = send_json(&env, "POST", "/sessions", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_finished_session_event_stream_sends_one_snapshot() {
    let env = test_state().await;
    let session_id = submit(&env, &[3]).await;
    wait_until_finished(&env.state, session_id).await;

    let request = Request::builder()
        .uri(format!("/sessions/{}/events", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&env, request).await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert_eq!(text.matches("event: SessionSnapshot").count(), 1);
    assert!(text.contains("COMPLETED"));
}

#[tokio::test]
async fn test_replay_of_completed_session_is_accepted() {
    let env = test_state().await;
    let session_id = submit(&env, &[1]).await;
    wait_until_finished(&env.state, session_id).await;

    let (status, body) =
        send_json(&env, "POST", &format!("/sessions/{}/replay", session_id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let replay_id: Uuid = body["session_id"].as_str().unwrap().parse().unwrap();
    assert_ne!(replay_id, session_id);

    let replay = wait_until_finished(&env.state, replay_id).await;
    assert_eq!(replay.state, SessionState::Completed);
    assert_eq!(replay.replay_of, Some(session_id));
}

#[tokio::test]
async fn test_replay_of_stale_orphan_is_accepted() {
    let env = test_state().await;
    let preset = env.state.presets.get("fast").await.unwrap();
    let target = CandidateTarget::Inline {
        candidates: vec![Candidate::from_bytes("cover-5", noise_cover(5))],
    };
    let mut stuck = Session::new(
        StartedBy::Manual,
        "fast".to_string(),
        preset,
        target,
        vec![ImageItem::new(0, "seed-5".to_string(), "fp".to_string())],
    );
    stuck.mark_processing();
    stuck.last_updated = Utc::now() - Duration::minutes(30);
    db::sessions::save_session(&env.state.db, &stuck).await.unwrap();
    db::inputs::save_inputs(
        &env.state.db,
        stuck.session_id,
        &[SubmittedImage::new("seed-5", noise_cover(5))],
    )
    .await
    .unwrap();

    let (_, before) = get_json(&env, &format!("/sessions/{}", stuck.session_id)).await;
    assert_eq!(before["state"], "PROCESSING");
    assert_eq!(before["is_stale"], true);

    let (status, body) = send_json(
        &env,
        "POST",
        &format!("/sessions/{}/replay", stuck.session_id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let replay_id: Uuid = body["session_id"].as_str().unwrap().parse().unwrap();

    let replay = wait_until_finished(&env.state, replay_id).await;
    assert_eq!(replay.state, SessionState::Completed);
    assert_eq!(replay.replay_of, Some(stuck.session_id));

    // The orphan keeps its state and points at its replacement
    let original = env.state.orchestrator.get_session(stuck.session_id).await.unwrap();
    assert_eq!(original.state, SessionState::Processing);
    assert_eq!(original.replayed_by, Some(replay_id));
}

#[tokio::test]
async fn test_preset_endpoints() {
    let env = test_state().await;

    let (status, catalog) = get_json(&env, "/config/presets").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(catalog["performance_level"], "balanced");

    let (status, fast) = get_json(&env, "/config/presets/fast").await;
    assert_eq!(status, StatusCode::OK);

    let mut custom = fast.clone();
    custom["similarity_threshold"] = json!(0.42);
    let (status, _) = send_json(&env, "PUT", "/config/presets/custom", custom).await;
    assert_eq!(status, StatusCode::OK);
    let (status, stored) = get_json(&env, "/config/presets/custom").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["similarity_threshold"], 0.42);

    let mut unknown_detector = fast;
    unknown_detector["detectors"] = json!({ "sparkle": true });
    let (status, body) =
        send_json(&env, "PUT", "/config/presets/custom", unknown_detector).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = send_json(
        &env,
        "PUT",
        "/config/active",
        json!({ "performance_level": "nope" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &env,
        "PUT",
        "/config/active",
        json!({ "performance_level": "custom" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, catalog) = get_json(&env, "/config/presets").await;
    assert_eq!(catalog["performance_level"], "custom");
}

#[tokio::test]
async fn test_cache_endpoints() {
    let env = test_state().await;
    let session_id = submit(&env, &[1]).await;
    wait_until_finished(&env.state, session_id).await;

    let (status, stats) = get_json(&env, "/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    let entries = stats["entry_count"].as_u64().unwrap();
    assert!(entries > 0);

    let (status, _) = send_json(&env, "POST", "/cache/invalidate", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send_json(
        &env,
        "POST",
        "/cache/invalidate",
        json!({ "key": "a", "all": true }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        send_json(&env, "POST", "/cache/invalidate", json!({ "all": true })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed_entries"].as_u64(), Some(entries));

    let (_, stats) = get_json(&env, "/cache/stats").await;
    assert_eq!(stats["entry_count"], 0);
}
