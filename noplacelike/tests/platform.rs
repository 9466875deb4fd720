//! Whole-platform integration: two running instances, full lifecycle,
//! and bounded shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use noplacelike::Platform;
use noplacelike_core::service::BoxFuture;
use noplacelike_core::{PlatformConfig, PlatformError};
use noplacelike_http::router;
use noplacelike_plugins::{Plugin, PluginContext, PluginState};

fn test_config() -> PlatformConfig {
    let mut config = PlatformConfig::default();
    config.auth.secret = "integration-secret".to_string();
    config.auth.bootstrap_token = "bootstrap".to_string();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.discovery.port = 0;
    config.discovery.broadcast_addr = "127.0.0.1".to_string();
    config.discovery.response_window_secs = 1;
    config.peers.port = 0;
    config
}

async fn launch(config: PlatformConfig) -> (Arc<Platform>, tokio::task::JoinHandle<Result<(), PlatformError>>) {
    let platform = Arc::new(Platform::build(config).await.expect("platform builds"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let serving = {
        let platform = platform.clone();
        tokio::spawn(async move { platform.serve_on(listener).await })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while !platform.state.services.is_running() {
        assert!(Instant::now() < deadline, "platform should start");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (platform, serving)
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn two_instances_list_each_other_over_the_api() {
    let (a, serving_a) = launch(test_config()).await;
    let (b, serving_b) = launch(test_config()).await;

    let b_discovery = b.state.peers.discovery_addr().expect("b discovery bound");
    a.state.peers.set_discovery_target(loopback(b_discovery));

    // One discovery pass through the HTTP surface.
    let response = router(a.state.clone())
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/network/peers/discover")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let a_id = a.state.peers.local_descriptor().id;
    let b_id = b.state.peers.local_descriptor().id;

    let peers_of_a = body_json(
        router(a.state.clone())
            .oneshot(Request::builder().uri("/api/network/peers").body(Body::empty()).unwrap())
            .await
            .unwrap(),
    )
    .await;
    let seen_b = peers_of_a
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["id"] == serde_json::json!(b_id))
        .expect("instance a should list instance b");
    assert_eq!(seen_b["version"], env!("CARGO_PKG_VERSION"));
    assert!(seen_b["capabilities"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("clipboard")));

    let peers_of_b = body_json(
        router(b.state.clone())
            .oneshot(Request::builder().uri("/api/network/peers").body(Body::empty()).unwrap())
            .await
            .unwrap(),
    )
    .await;
    assert!(peers_of_b
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["id"] == serde_json::json!(a_id)));

    a.shutdown_token().cancel();
    b.shutdown_token().cancel();
    serving_a.await.unwrap().unwrap();
    serving_b.await.unwrap().unwrap();
}

struct ChainPlugin {
    name: String,
    deps: Vec<String>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ChainPlugin {
    fn new(name: &str, deps: &[&str], log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            log,
        })
    }
}

impl Plugin for ChainPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn initialize(&self, _ctx: PluginContext) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn start(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        })
    }
}

#[tokio::test]
async fn platform_lifecycle_orders_plugins_and_stops_cleanly() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let platform = Arc::new(Platform::build(test_config()).await.unwrap());
    platform
        .state
        .plugins
        .register(ChainPlugin::new("a", &[], log.clone()))
        .unwrap();
    platform
        .state
        .plugins
        .register(ChainPlugin::new("b", &["a"], log.clone()))
        .unwrap();
    platform
        .state
        .plugins
        .register(ChainPlugin::new("c", &["b"], log.clone()))
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let serving = {
        let platform = platform.clone();
        tokio::spawn(async move { platform.serve_on(listener).await })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while !platform.state.services.is_running() {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec!["start:a", "start:b", "start:c"]
    );

    // A dependency with live dependents cannot be unloaded.
    let err = platform.state.plugins.unload("a").await.unwrap_err();
    assert!(matches!(err, PlatformError::Conflict(_)));
    assert!(err.to_string().contains('b'));

    platform.shutdown_token().cancel();
    serving.await.unwrap().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"
        ]
    );
    for name in ["a", "b", "c"] {
        assert_eq!(
            platform.state.plugins.info(name).unwrap().state,
            PluginState::Stopped
        );
    }

    // The bus stops last; nothing can publish afterwards.
    assert!(platform
        .state
        .bus
        .publish(noplacelike_core::PlatformEvent::new(
            "late.event",
            "test",
            serde_json::Value::Null,
        ))
        .is_err());
}

#[tokio::test]
async fn zero_deadline_stop_returns_promptly() {
    let platform = Platform::build(test_config()).await.unwrap();
    platform.state.services.start_all().await.unwrap();

    let start = Instant::now();
    platform.stop(Duration::ZERO).await;
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "forced stop took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn generous_deadline_stop_is_clean() {
    let platform = Platform::build(test_config()).await.unwrap();
    platform.state.services.start_all().await.unwrap();
    platform.stop(Duration::from_secs(10)).await;
    assert!(!platform.state.services.is_running());
}
