//! Preset configuration endpoints
//!
//! GET /config/presets, GET|PUT /config/presets/:name, PUT /config/active

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{ConfigPreset, PresetCatalog};
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivePresetRequest {
    pub performance_level: String,
}

/// GET /config/presets
pub async fn list_presets(State(state): State<AppState>) -> Json<PresetCatalog> {
    Json(state.presets.catalog().await)
}

/// GET /config/presets/:name
pub async fn get_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ConfigPreset>> {
    Ok(Json(state.presets.get(&name).await?))
}

/// PUT /config/presets/:name
///
/// Unknown detectors or fields are rejected with 400. Applies to sessions
/// submitted afterwards.
pub async fn put_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<ConfigPreset>> {
    let preset: ConfigPreset = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid preset: {}", e)))?;
    state.presets.put(&name, preset.clone()).await?;
    info!(preset = %name, "Preset stored via API");
    Ok(Json(preset))
}

/// PUT /config/active
pub async fn set_active_preset(
    State(state): State<AppState>,
    Json(request): Json<ActivePresetRequest>,
) -> ApiResult<Json<ActivePresetRequest>> {
    state.presets.set_active(&request.performance_level).await?;
    Ok(Json(request))
}

pub fn preset_routes() -> Router<AppState> {
    Router::new()
        .route("/config/presets", get(list_presets))
        .route("/config/presets/:name", get(get_preset).put(put_preset))
        .route("/config/active", put(set_active_preset))
}
