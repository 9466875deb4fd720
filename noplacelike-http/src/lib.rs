//! HTTP front door.
//!
//! Mounts the platform, plugin, event, and resource endpoints behind one
//! middleware chain: panic recovery, access log + metrics, CORS, request
//! size cap, security headers, rate limit, and per-route auth.

pub mod handlers;
pub mod middleware;
pub mod state;

pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use noplacelike_core::PlatformError;

use crate::middleware::{
    normalize_path, rate_limited_response, security_headers, RateLimiter, RequireAuth,
};

/// Assemble the full router for the given state.
pub fn router(state: AppState) -> Router {
    let auth_enabled = state.config.auth.enabled;
    let security = state.security.clone();

    let plugins_start = RequireAuth::new(security.clone(), auth_enabled, &["plugins:start"]);
    let plugins_stop = RequireAuth::new(security.clone(), auth_enabled, &["plugins:stop"]);
    let resources_create = RequireAuth::new(security.clone(), auth_enabled, &["resources:create"]);
    let resources_delete = RequireAuth::new(security, auth_enabled, &["resources:delete"]);

    let mut app = Router::new()
        .route("/health", get(handlers::platform::health))
        .route("/info", get(handlers::platform::info))
        .route("/api/platform/health", get(handlers::platform::health))
        .route("/api/platform/info", get(handlers::platform::info))
        .route("/api/platform/metrics", get(handlers::platform::metrics))
        .route("/api/platform/token", post(handlers::platform::issue_token))
        .route("/api/plugins", get(handlers::plugins::list))
        .route("/api/plugins/{name}", get(handlers::plugins::get))
        .route("/api/plugins/{name}/health", get(handlers::plugins::health))
        .route(
            "/api/plugins/{name}/start",
            post(handlers::plugins::start).route_layer(plugins_start),
        )
        .route(
            "/api/plugins/{name}/stop",
            post(handlers::plugins::stop).route_layer(plugins_stop),
        )
        .route("/api/network/peers", get(handlers::network::list))
        .route("/api/network/peers/discover", post(handlers::network::discover))
        .route("/api/network/peers/{id}", get(handlers::network::get))
        .route(
            "/api/resources",
            get(handlers::resources::list)
                .merge(post(handlers::resources::create).route_layer(resources_create)),
        )
        .route(
            "/api/resources/{id}",
            get(handlers::resources::get)
                .merge(delete(handlers::resources::delete).route_layer(resources_delete)),
        )
        .route("/api/resources/{id}/stream", get(handlers::resources::stream))
        .route("/api/events/stream", get(handlers::events::stream))
        .route("/api/events/publish", post(handlers::events::publish))
        .route("/plugins/{name}", axum::routing::any(handlers::dispatch::root))
        .route(
            "/plugins/{name}/{*rest}",
            axum::routing::any(handlers::dispatch::sub),
        )
        .with_state(state.clone());

    // Layers apply outermost-last: the chain below builds rate limit as
    // the innermost and panic recovery as the outermost.
    if state.config.rate_limit.enabled {
        let limiter = Arc::new(RateLimiter::new(
            state.config.rate_limit.max_requests,
            Duration::from_secs(state.config.rate_limit.window_secs),
        ));
        app = app.layer(from_fn(move |req: Request, next: Next| {
            let limiter = limiter.clone();
            async move {
                let key = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
                    .unwrap_or_else(|| "local".to_string());
                if !limiter.try_acquire(&key) {
                    return rate_limited_response();
                }
                next.run(req).await
            }
        }));
    }

    let metrics = state.metrics.clone();
    app.layer(from_fn(security_headers))
        .layer(RequestBodyLimitLayer::new(state.config.server.max_body_bytes))
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(build_cors(&state.config.server.cors_origins))
        .layer(from_fn(move |req: Request, next: Next| {
            let metrics = metrics.clone();
            async move {
                let method = req.method().to_string();
                let path = normalize_path(req.uri().path());
                metrics.http_requests_in_flight.inc();
                let start = Instant::now();
                let response = next.run(req).await;
                metrics.http_requests_in_flight.dec();
                let elapsed = start.elapsed();
                let status = response.status().as_u16();
                metrics.record_request(&method, &path, status, elapsed.as_secs_f64());
                info!(
                    method = %method,
                    path = %path,
                    status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request"
                );
                response
            }
        }))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(
            panic_handler as fn(Box<dyn std::any::Any + Send>) -> axum::response::Response,
        ))
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let list: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(list)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

fn panic_handler(_err: Box<dyn std::any::Any + Send>) -> axum::response::Response {
    let body = serde_json::json!({ "error": "internal server error" });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// Serve the assembled router until the shutdown token fires, then stop
/// accepting connections and drain gracefully.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), PlatformError> {
    let app = router(state);
    let addr = listener
        .local_addr()
        .map_err(|e| PlatformError::Internal(e.to_string()))?;
    info!(%addr, "http front door listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| PlatformError::Internal(e.to_string()))
}
