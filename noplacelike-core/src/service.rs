use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::PlatformError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health of a single service.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "status", content = "reason")]
pub enum HealthState {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

/// A long-lived platform component managed by the [`ServiceManager`].
///
/// `start` must return once the component is running; long-running work
/// belongs on tasks owned by the component and tied to the shutdown token.
/// `stop` must return within `deadline`, forcibly closing sockets if a
/// graceful close would block longer.
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Names of services that must be started before this one.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    fn start(&self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>>;

    fn stop(&self, deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>>;

    fn health(&self) -> BoxFuture<'_, HealthState>;

    /// JSON schema of the service's configuration section, when it has one.
    fn config_schema(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}
