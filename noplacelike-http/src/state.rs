use std::sync::Arc;

use chrono::{DateTime, Utc};

use noplacelike_core::{PlatformConfig, ServiceManager};
use noplacelike_events::EventBus;
use noplacelike_metrics::Metrics;
use noplacelike_peers::PeerManager;
use noplacelike_plugins::PluginManager;
use noplacelike_resources::ResourceManager;
use noplacelike_security::SecurityManager;

/// Handles to every manager the HTTP surface touches. Cheap to clone;
/// everything inside is shared.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceManager>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub security: Arc<SecurityManager>,
    pub resources: Arc<ResourceManager>,
    pub plugins: Arc<PluginManager>,
    pub peers: Arc<PeerManager>,
    pub config: Arc<PlatformConfig>,
    pub started_at: DateTime<Utc>,
}
