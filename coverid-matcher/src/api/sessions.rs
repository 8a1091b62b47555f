//! Session API handlers
//!
//! POST /sessions, POST /evaluations, GET /sessions, GET /sessions/:id,
//! GET /sessions/:id/results, POST /sessions/:id/replay

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use coverid_common::events::{SessionSnapshot, SessionState};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::inputs::SubmittedImage;
use crate::models::CandidateTarget;
use crate::services::{SessionResults, SubmitOptions};
use crate::{ApiError, ApiResult, AppState};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// One submitted image, base64 encoded
#[derive(Debug, Deserialize)]
pub struct ImagePayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "crate::utils::base64_bytes")]
    pub data: Vec<u8>,
}

/// POST /sessions request
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub images: Vec<ImagePayload>,
    pub target: CandidateTarget,
    /// Preset name; the active preset when absent
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub result_batch: Option<usize>,
}

impl SubmitRequest {
    fn into_parts(self) -> (Vec<SubmittedImage>, CandidateTarget, SubmitOptions) {
        let images = self
            .images
            .into_iter()
            .enumerate()
            .map(|(index, image)| {
                let name = image
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("image-{}", index + 1));
                SubmittedImage::new(name, image.data)
            })
            .collect();
        let options = SubmitOptions {
            preset: self.preset,
            similarity_threshold: self.similarity_threshold,
            result_batch: self.result_batch,
        };
        (images, self.target, options)
    }
}

/// POST /evaluations request
#[derive(Debug, Deserialize)]
pub struct EvaluationRequest {
    /// Group name, e.g. the evaluated folder
    pub group: String,
    #[serde(flatten)]
    pub submission: SubmitRequest,
}

/// Response for every endpoint that starts a session
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub session_id: Uuid,
    pub state: SessionState,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub stale: bool,
    pub limit: Option<usize>,
}

/// POST /sessions
///
/// Returns 202 Accepted; matching continues in the background.
pub async fn submit_session(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let (images, target, options) = request.into_parts();
    let session_id = state.orchestrator.submit(images, target, options).await?;
    info!(session_id = %session_id, "Session submitted via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            session_id,
            state: SessionState::Queued,
        }),
    ))
}

/// POST /evaluations
pub async fn submit_evaluation(
    State(state): State<AppState>,
    Json(request): Json<EvaluationRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let (images, target, options) = request.submission.into_parts();
    let session_id = state
        .orchestrator
        .evaluate(&request.group, images, target, options)
        .await?;
    info!(session_id = %session_id, group = %request.group, "Evaluation submitted via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            session_id,
            state: SessionState::Queued,
        }),
    ))
}

/// GET /sessions?stale=true&limit=N
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<SessionSnapshot>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.orchestrator.list_sessions(limit, query.stale).await?))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionSnapshot>> {
    Ok(Json(state.orchestrator.get_session(session_id).await?))
}

/// GET /sessions/:id/results
pub async fn get_results(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionResults>> {
    Ok(Json(state.orchestrator.get_results(session_id).await?))
}

/// POST /sessions/:id/replay
///
/// 409 while a worker in this process is still running the session. Stale
/// sessions and orphans left by a restart can be replayed.
pub async fn replay_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let current = state.orchestrator.get_session(session_id).await?;
    let running = state.orchestrator.is_live(session_id) && !current.is_stale;
    if !current.state.is_terminal() && running {
        return Err(ApiError::Conflict(format!(
            "Session {} is still {}",
            session_id,
            current.state.as_str()
        )));
    }

    let replay_id = state.orchestrator.replay(session_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            session_id: replay_id,
            state: SessionState::Queued,
        }),
    ))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(submit_session).get(list_sessions))
        .route("/evaluations", post(submit_evaluation))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/results", get(get_results))
        .route("/sessions/:id/replay", post(replay_session))
}
