use axum::extract::{Path, State};
use axum::Json;

use noplacelike_core::PlatformError;
use noplacelike_plugins::{PluginInfo, PluginState};

use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> Json<Vec<PluginInfo>> {
    Json(state.plugins.list())
}

pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PluginInfo>, PlatformError> {
    state
        .plugins
        .info(&name)
        .map(Json)
        .ok_or_else(|| PlatformError::NotFound(format!("plugin {name} not found")))
}

pub async fn health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, PlatformError> {
    let info = state
        .plugins
        .info(&name)
        .ok_or_else(|| PlatformError::NotFound(format!("plugin {name} not found")))?;
    Ok(Json(serde_json::json!({
        "name": info.name,
        "state": info.state,
        "healthy": info.state == PluginState::Started,
    })))
}

/// `POST /api/plugins/{name}/start`. A stopped plugin is re-initialised
/// first, so the start cycle repeats cleanly.
pub async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, PlatformError> {
    let info = state
        .plugins
        .info(&name)
        .ok_or_else(|| PlatformError::NotFound(format!("plugin {name} not found")))?;
    if info.state == PluginState::Stopped || info.state == PluginState::Registered {
        state.plugins.initialize(&name).await?;
    }
    state.plugins.start(&name).await?;
    Ok(Json(serde_json::json!({ "name": name, "state": "started" })))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, PlatformError> {
    state.plugins.stop(&name).await?;
    Ok(Json(serde_json::json!({ "name": name, "state": "stopped" })))
}
