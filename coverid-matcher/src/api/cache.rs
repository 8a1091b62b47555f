//! Cache administration endpoints
//!
//! GET /cache/stats, POST /cache/invalidate

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use coverid_common::events::CoverEvent;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheStats;
use crate::{ApiError, ApiResult, AppState};

/// Exactly one of `key`, `prefix` or `all: true`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed_entries: u64,
}

/// GET /cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> ApiResult<Json<CacheStats>> {
    Ok(Json(state.cache.stats().await?))
}

/// POST /cache/invalidate
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> ApiResult<Json<InvalidateResponse>> {
    let (scope, removed_entries) = match (request.key, request.prefix, request.all) {
        (Some(key), None, false) => {
            let removed = state.cache.invalidate(&key).await?;
            (key, u64::from(removed))
        }
        (None, Some(prefix), false) if !prefix.is_empty() => {
            let removed = state.cache.invalidate_prefix(&prefix).await?;
            (prefix, removed)
        }
        (None, None, true) => (String::new(), state.cache.clear().await?),
        _ => {
            return Err(ApiError::BadRequest(
                "Specify exactly one of key, a non-empty prefix, or all: true".to_string(),
            ))
        }
    };

    info!(scope = %scope, removed_entries, "Cache invalidated via API");
    state.event_bus.emit_lossy(CoverEvent::CacheInvalidated {
        prefix: scope,
        removed_entries,
        timestamp: Utc::now(),
    });
    Ok(Json(InvalidateResponse { removed_entries }))
}

pub fn cache_routes() -> Router<AppState> {
    Router::new()
        .route("/cache/stats", get(cache_stats))
        .route("/cache/invalidate", post(invalidate_cache))
}
