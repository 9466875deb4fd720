use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use noplacelike_core::{HealthState, PlatformError};
use noplacelike_metrics::PROMETHEUS_CONTENT_TYPE;

use crate::middleware::bearer_token;
use crate::state::AppState;

/// `GET /health` — 200 healthy, 206 degraded, 503 unhealthy.
pub async fn health(State(state): State<AppState>) -> Response {
    let health = state.services.health().await;
    let status = match &health.status {
        HealthState::Healthy => StatusCode::OK,
        HealthState::Degraded(_) => StatusCode::PARTIAL_CONTENT,
        HealthState::Unhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health)).into_response()
}

/// `GET /info` — platform metadata snapshot.
pub async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let local = state.peers.local_descriptor();
    let name = if state.config.name.is_empty() {
        local.name.clone()
    } else {
        state.config.name.clone()
    };
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "id": local.id,
        "name": name,
        "version": env!("CARGO_PKG_VERSION"),
        "address": local.address,
        "port": state.config.server.port,
        "started_at": state.started_at,
        "uptime_secs": uptime,
        "capabilities": local.capabilities,
        "plugins": state.plugins.list().len(),
        "peers": state.peers.peer_count(),
        "resources": state.resources.count(),
        "subscriptions": state.bus.subscription_count(),
        "shared_dirs": state.config.shared_dirs,
    }))
}

#[derive(Deserialize)]
pub struct MetricsQuery {
    format: Option<String>,
}

/// Fold the managers' own counters into the registry before rendering.
fn sync_platform_metrics(state: &AppState) {
    let metrics = &state.metrics;
    metrics.peers_known.set(state.peers.peer_count() as i64);
    metrics
        .resources_registered
        .set(state.resources.count() as i64);
    metrics
        .plugins_started
        .set(state.plugins.started_count() as i64);

    let published = state.bus.published_total();
    let counted = metrics.events_published_total.get();
    if published > counted {
        metrics.events_published_total.inc_by(published - counted);
    }
    let dropped = state.bus.dropped_total();
    let counted = metrics.events_dropped_total.get();
    if dropped > counted {
        metrics.events_dropped_total.inc_by(dropped - counted);
    }
    let sent = state.peers.messages_sent();
    let counted = metrics.peer_messages_sent_total.get();
    if sent > counted {
        metrics.peer_messages_sent_total.inc_by(sent - counted);
    }
    let received = state.peers.messages_received();
    let counted = metrics.peer_messages_received_total.get();
    if received > counted {
        metrics.peer_messages_received_total.inc_by(received - counted);
    }
}

/// `GET /api/platform/metrics?format=prometheus|json`.
pub async fn metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> Response {
    sync_platform_metrics(&state);
    match query.format.as_deref() {
        Some("json") => Json(state.metrics.render_json()).into_response(),
        _ => (
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            state.metrics.render_prometheus(),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct TokenRequest {
    subject: String,
    #[serde(default)]
    permissions: Vec<String>,
    ttl_secs: Option<u64>,
}

/// `POST /api/platform/token` — bootstrap-credential only.
pub async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<serde_json::Value>, PlatformError> {
    let bootstrap = &state.config.auth.bootstrap_token;
    if bootstrap.is_empty() {
        return Err(PlatformError::Unavailable(
            "token issuing is not configured".to_string(),
        ));
    }
    let presented = bearer_token(&headers).map_err(PlatformError::from)?;
    if presented != bootstrap {
        return Err(PlatformError::Unauthorized("invalid token".to_string()));
    }
    if request.subject.is_empty() {
        return Err(PlatformError::InvalidRequest(
            "subject is required".to_string(),
        ));
    }
    let ttl = request.ttl_secs.map(Duration::from_secs);
    let token = state
        .security
        .issue(&request.subject, request.permissions.clone(), ttl)
        .map_err(PlatformError::from)?;
    Ok(Json(serde_json::json!({
        "token": token,
        "subject": request.subject,
        "permissions": request.permissions,
    })))
}
