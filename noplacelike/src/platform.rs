//! Platform assembly: wires every manager together, registers them with
//! the service lifecycle, and runs the HTTP front door.
//!
//! Shutdown follows the dependency order in reverse: the front door stops
//! accepting first (graceful serve shutdown), then plugins, peers,
//! resources, and finally the event bus, which was registered first so
//! nothing publishes after it stops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use noplacelike_core::{PlatformConfig, PlatformError, ServiceManager};
use noplacelike_events::EventBus;
use noplacelike_http::AppState;
use noplacelike_metrics::Metrics;
use noplacelike_peers::{PeerDescriptor, PeerManager, PeerNetConfig};
use noplacelike_plugins::PluginManager;
use noplacelike_resources::ResourceManager;
use noplacelike_security::{ChannelCrypto, SecurityManager};

/// Capabilities this build advertises in discovery frames.
const CAPABILITIES: &[&str] = &["clipboard", "files", "system-info", "events"];

const STOP_DEADLINE: Duration = Duration::from_secs(10);

pub struct Platform {
    pub state: AppState,
    shutdown: CancellationToken,
}

impl Platform {
    /// Construct every manager and register them with the lifecycle in
    /// dependency order. Nothing is started yet.
    pub async fn build(config: PlatformConfig) -> Result<Self, PlatformError> {
        config.validate()?;
        let config = Arc::new(config);

        let bus = Arc::new(EventBus::with_capacity(config.events.buffer_capacity));
        let metrics = Metrics::new();
        let security = Arc::new(SecurityManager::new(
            &config.auth.secret,
            Duration::from_secs(config.auth.token_ttl_secs),
        ));
        let resources = ResourceManager::new(bus.clone());
        let plugins = PluginManager::new(bus.clone(), resources.clone(), config.clone());

        let crypto = if config.auth.enabled && config.auth.channel_crypto {
            Some(Arc::new(ChannelCrypto::new(&config.auth.secret)))
        } else {
            None
        };
        let local = PeerDescriptor::local(
            config.server.port,
            config.peers.port,
            CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        );
        let peers = PeerManager::new(
            local,
            PeerNetConfig::from_platform(&config),
            bus.clone(),
            crypto,
        );

        let services = Arc::new(ServiceManager::new());
        // Registration order is the tiebreak for startup, and its reverse
        // is the shutdown order: the bus goes first so it stops last.
        services.register(bus.clone()).await?;
        services.register(metrics.clone()).await?;
        services.register(security.clone()).await?;
        services.register(resources.clone()).await?;
        services.register(peers.clone()).await?;
        services.register(plugins.clone()).await?;

        let state = AppState {
            services,
            bus,
            metrics,
            security,
            resources,
            plugins,
            peers,
            config,
            started_at: Utc::now(),
        };
        Ok(Self {
            state,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling this token initiates a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve_until_shutdown(&self) -> Result<(), PlatformError> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            PlatformError::Internal(format!("cannot bind {addr}: {e}"))
        })?;
        self.serve_on(listener).await
    }

    /// Start every service, then serve HTTP on the given listener until
    /// the shutdown token fires.
    pub async fn serve_on(&self, listener: tokio::net::TcpListener) -> Result<(), PlatformError> {
        self.state.services.start_all().await?;
        if let Ok(addr) = listener.local_addr() {
            self.state.peers.set_local_http_port(addr.port());
        }
        info!(
            peer = %self.state.peers.local_descriptor().id,
            "platform running"
        );

        let result =
            noplacelike_http::serve(listener, self.state.clone(), self.shutdown.clone()).await;

        self.state.services.stop_all(STOP_DEADLINE).await;
        info!("platform stopped");
        result
    }

    /// Stop everything without having served HTTP; used by tests and
    /// fatal-error paths.
    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.cancel();
        self.state.services.stop_all(deadline).await;
    }
}
