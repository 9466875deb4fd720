use axum::extract::{Path, State};
use axum::Json;

use noplacelike_core::PlatformError;
use noplacelike_peers::PeerInfo;

use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> Json<Vec<PeerInfo>> {
    Json(state.peers.peers_snapshot())
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PeerInfo>, PlatformError> {
    state
        .peers
        .peer(&id)
        .map(Json)
        .ok_or_else(|| PlatformError::NotFound(format!("peer {id} not found")))
}

/// `POST /api/network/peers/discover` — one bounded discovery pass,
/// returning the merged table.
pub async fn discover(
    State(state): State<AppState>,
) -> Result<Json<Vec<PeerInfo>>, PlatformError> {
    state.peers.discover_once().await.map(Json)
}
