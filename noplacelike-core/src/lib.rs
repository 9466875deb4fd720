pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod manager;
pub mod service;

pub use config::{
    default_config_path, resolve_config_path, AuthConfig, DiscoverySection, EventsSection,
    PeersSection, PlatformConfig, RateLimitSection, ServerSection,
};
pub use error::PlatformError;
pub use event::PlatformEvent;
pub use logging::init_tracing;
pub use manager::{AggregatedHealth, ServiceManager, ServiceReport};
pub use service::{BoxFuture, HealthState, Service};
