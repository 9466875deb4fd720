//! In-process tests of the HTTP surface, driven through
//! `tower::ServiceExt::oneshot` without binding a port.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{
    HealthState, PlatformConfig, PlatformError, PlatformEvent, Service, ServiceManager,
};
use noplacelike_events::EventBus;
use noplacelike_http::{router, AppState};
use noplacelike_metrics::Metrics;
use noplacelike_peers::{PeerDescriptor, PeerManager, PeerNetConfig};
use noplacelike_plugins::{Plugin, PluginContext, PluginManager, PluginRoute, RouteAuth};
use noplacelike_resources::ResourceManager;
use noplacelike_security::SecurityManager;

const SECRET: &str = "api-test-secret";
const BOOTSTRAP: &str = "bootstrap-credential";

fn test_config() -> PlatformConfig {
    let mut config = PlatformConfig::default();
    config.auth.secret = SECRET.to_string();
    config.auth.bootstrap_token = BOOTSTRAP.to_string();
    config
}

fn test_state(config: PlatformConfig) -> AppState {
    let config = Arc::new(config);
    let bus = Arc::new(EventBus::new());
    let resources = ResourceManager::new(bus.clone());
    let plugins = PluginManager::new(bus.clone(), resources.clone(), config.clone());
    let peers = PeerManager::new(
        PeerDescriptor::local(0, 0, vec!["clipboard".to_string()]),
        PeerNetConfig::from_platform(&config),
        bus.clone(),
        None,
    );
    AppState {
        services: Arc::new(ServiceManager::new()),
        bus,
        metrics: Metrics::new(),
        security: Arc::new(SecurityManager::new(SECRET, Duration::from_secs(3600))),
        resources,
        plugins,
        peers,
        config,
        started_at: Utc::now(),
    }
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: serde_json::Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn delete(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::DELETE).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── platform endpoints ─────────────────────────────────────────────────

#[tokio::test]
async fn health_reflects_aggregate_state() {
    let state = test_state(test_config());
    let app = router(state.clone());

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    struct Wobbly(&'static str, HealthState);
    impl Service for Wobbly {
        fn name(&self) -> &str {
            self.0
        }
        fn start(
            &self,
            _s: tokio_util::sync::CancellationToken,
        ) -> BoxFuture<'_, Result<(), PlatformError>> {
            Box::pin(async { Ok(()) })
        }
        fn stop(&self, _d: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
            Box::pin(async { Ok(()) })
        }
        fn health(&self) -> BoxFuture<'_, HealthState> {
            let state = self.1.clone();
            Box::pin(async move { state })
        }
    }

    state
        .services
        .register(Arc::new(Wobbly("wobbly", HealthState::Degraded("drops".into()))))
        .await
        .unwrap();
    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

    state
        .services
        .register(Arc::new(Wobbly("broken", HealthState::Unhealthy("down".into()))))
        .await
        .unwrap();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn info_exposes_platform_snapshot() {
    let state = test_state(test_config());
    let app = router(state);

    let response = app.oneshot(get("/info")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert!(info["id"].as_str().is_some());
    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(info["peers"], 0);
    assert!(info["capabilities"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("clipboard")));
}

#[tokio::test]
async fn metrics_render_in_both_formats() {
    let state = test_state(test_config());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(get("/api/platform/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let response = app
        .oneshot(get("/api/platform/metrics?format=json"))
        .await
        .unwrap();
    let families = body_json(response).await;
    assert!(families.get("noplacelike_http_requests_total").is_some());
}

#[tokio::test]
async fn security_headers_are_always_present() {
    let state = test_state(test_config());
    let app = router(state);
    let response = app.oneshot(get("/health")).await.unwrap();
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-xss-protection"], "0");
    assert!(headers.contains_key("strict-transport-security"));
}

// ── token issuing ──────────────────────────────────────────────────────

#[tokio::test]
async fn token_endpoint_requires_bootstrap_credential() {
    let state = test_state(test_config());
    let app = router(state);

    let request = serde_json::json!({ "subject": "alice", "permissions": ["resources:create"] });
    let response = app
        .clone()
        .oneshot(post_json("/api/platform/token", request.clone(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/platform/token",
            request.clone(),
            Some("wrong"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(post_json("/api/platform/token", request, Some(BOOTSTRAP)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["token"].as_str().unwrap().len() > 20);
}

// ── authorization matrix ───────────────────────────────────────────────

#[tokio::test]
async fn protected_route_rejects_every_bad_credential_shape() {
    let state = test_state(test_config());
    let app = router(state.clone());
    let payload = serde_json::json!({ "id": "r1", "type": "memory", "data": "x" });

    // Missing header.
    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload.clone(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "authorization required");

    // Wrong scheme.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/resources")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Basic abc")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await["error"],
        "invalid authorization scheme"
    );

    // Garbage token.
    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload.clone(), Some("junk")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid token");

    // Expired token.
    let expired = state
        .security
        .issue(
            "alice",
            ["resources:create".to_string()],
            Some(Duration::ZERO),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload.clone(), Some(&expired)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid token");

    // Insufficient permissions.
    let wrong_perm = state
        .security
        .issue("alice", ["resources:delete".to_string()], None)
        .unwrap();
    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload.clone(), Some(&wrong_perm)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        body_json(response).await["error"],
        "insufficient permissions"
    );

    // None of the failures registered the resource.
    assert_eq!(state.resources.count(), 0);
}

#[tokio::test]
async fn create_then_delete_needs_distinct_permissions() {
    let state = test_state(test_config());
    let app = router(state.clone());
    let create_only = state
        .security
        .issue("alice", ["resources:create".to_string()], None)
        .unwrap();

    let payload = serde_json::json!({ "id": "r1", "type": "memory", "data": "hello" });
    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload, Some(&create_only)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(delete("/api/resources/r1", Some(&create_only)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let delete_token = state
        .security
        .issue("alice", ["resources:delete".to_string()], None)
        .unwrap();
    let response = app
        .oneshot(delete("/api/resources/r1", Some(&delete_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

// ── resources ──────────────────────────────────────────────────────────

#[tokio::test]
async fn resource_roundtrip_over_http() {
    let state = test_state(test_config());
    let app = router(state.clone());
    let token = state
        .security
        .issue("alice", ["resources:create".to_string()], None)
        .unwrap();

    let payload = serde_json::json!({ "id": "R", "type": "memory", "data": "hello" });
    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload, Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let descriptor = body_json(response).await;
    assert_eq!(descriptor["type"], "memory");
    assert_eq!(descriptor["size"], 5);

    let response = app.clone().oneshot(get("/api/resources/R")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/resources?type=memory"))
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(get("/api/resources/R/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello");

    state.resources.unregister("R");
    let response = app
        .clone()
        .oneshot(get("/api/resources/R/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.oneshot(get("/api/resources/R")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_resource_id_is_conflict() {
    let state = test_state(test_config());
    let app = router(state.clone());
    let token = state
        .security
        .issue("alice", ["resources:create".to_string()], None)
        .unwrap();
    let payload = serde_json::json!({ "id": "dup", "type": "memory", "data": "x" });

    let response = app
        .clone()
        .oneshot(post_json("/api/resources", payload.clone(), Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let response = app
        .oneshot(post_json("/api/resources", payload, Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn oversized_body_is_rejected_with_413() {
    let mut config = test_config();
    config.server.max_body_bytes = 256;
    let state = test_state(config);
    let app = router(state.clone());
    let token = state
        .security
        .issue("alice", ["resources:create".to_string()], None)
        .unwrap();

    let payload = serde_json::json!({
        "id": "big",
        "type": "memory",
        "data": "x".repeat(1024),
    });
    let response = app
        .oneshot(post_json("/api/resources", payload, Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

// ── rate limiting ──────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limit_kicks_in_after_budget() {
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.max_requests = 2;
    config.rate_limit.window_secs = 60;
    let state = test_state(config);
    let app = router(state);

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ── events ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn publish_endpoint_injects_events() {
    let state = test_state(test_config());
    let app = router(state.clone());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    state
        .bus
        .subscribe(
            "custom.*",
            noplacelike_events::Owner::Platform,
            Arc::new(move |event| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send((*event).clone());
                })
            }),
        )
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/events/publish",
            serde_json::json!({ "type": "custom.ping", "payload": { "n": 1 } }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "custom.ping");
    assert_eq!(event.source, "api");

    // A valid token attributes the event to its subject.
    let token = state.security.issue("alice", [], None).unwrap();
    app.clone()
        .oneshot(post_json(
            "/api/events/publish",
            serde_json::json!({ "type": "custom.hello" }),
            Some(&token),
        ))
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.source, "alice");

    let response = app
        .oneshot(post_json(
            "/api/events/publish",
            serde_json::json!({ "type": "" }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sse_stream_delivers_events_in_order_and_unsubscribes_on_drop() {
    let state = test_state(test_config());
    let app = router(state.clone());
    assert_eq!(state.bus.subscription_count(), 0);

    let response = app.oneshot(get("/api/events/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(state.bus.subscription_count(), 1);

    for n in 0..5 {
        state
            .bus
            .publish(PlatformEvent::new(
                "sse.test",
                "platform",
                serde_json::json!({ "n": n }),
            ))
            .unwrap();
    }

    let mut body = response.into_body();
    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while text.matches("data:").count() < 5 {
        let frame = tokio::time::timeout_at(deadline, body.frame())
            .await
            .expect("sse frames should arrive")
            .expect("stream should stay open")
            .expect("frame should be readable");
        if let Some(data) = frame.data_ref() {
            text.push_str(&String::from_utf8_lossy(data));
        }
    }
    let ns: Vec<i64> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|json| serde_json::from_str::<serde_json::Value>(json).ok())
        .filter_map(|v| v["payload"]["n"].as_i64())
        .collect();
    assert_eq!(ns, vec![0, 1, 2, 3, 4]);

    // Client disconnect tears the subscription down.
    drop(body);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.bus.subscription_count(), 0);
}

// ── plugin routes ──────────────────────────────────────────────────────

struct EchoPlugin;

impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn initialize(&self, _ctx: PluginContext) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn start(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn routes(&self) -> Vec<PluginRoute> {
        vec![
            PluginRoute::new(
                Method::GET,
                "/hello",
                axum::routing::get(|| async { "hello from echo" }),
            ),
            PluginRoute::new(
                Method::POST,
                "/admin",
                axum::routing::post(|| async { "admin ok" }),
            )
            .with_auth(RouteAuth::required(["echo:admin"])),
        ]
    }
}

#[tokio::test]
async fn plugin_routes_mount_under_namespace_with_auth() {
    let state = test_state(test_config());
    let app = router(state.clone());

    state.plugins.register(Arc::new(EchoPlugin)).unwrap();
    state.plugins.initialize("echo").await.unwrap();

    // Not started yet: nothing mounted.
    let response = app.clone().oneshot(get("/plugins/echo/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    state.plugins.start("echo").await.unwrap();
    let response = app.clone().oneshot(get("/plugins/echo/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello from echo");

    // The contributed auth requirement is enforced by the front door.
    let response = app
        .clone()
        .oneshot(post_json("/plugins/echo/admin", serde_json::json!({}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = state
        .security
        .issue("op", ["echo:admin".to_string()], None)
        .unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            "/plugins/echo/admin",
            serde_json::json!({}),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Stop tears the mount down again.
    state.plugins.stop("echo").await.unwrap();
    let response = app.oneshot(get("/plugins/echo/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plugin_lifecycle_endpoints_require_permissions() {
    let state = test_state(test_config());
    let app = router(state.clone());
    state.plugins.register(Arc::new(EchoPlugin)).unwrap();
    state.plugins.initialize("echo").await.unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/plugins/echo/start",
            serde_json::json!({}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = state
        .security
        .issue(
            "op",
            ["plugins:start".to_string(), "plugins:stop".to_string()],
            None,
        )
        .unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/plugins/echo/start",
            serde_json::json!({}),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/plugins/echo"))
        .await
        .unwrap();
    let info = body_json(response).await;
    assert_eq!(info["state"], "started");

    let response = app
        .oneshot(post_json(
            "/api/plugins/echo/stop",
            serde_json::json!({}),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
