//! Plugin subsystem.
//!
//! A plugin is an in-process extension contributing routes, event
//! subscriptions, and resources. The manager owns every plugin object and
//! drives the lifecycle
//!
//! ```text
//! Registered -> Initialized -> Started -> Stopped -> (Initialized | Failed)
//! ```
//!
//! Dependencies form an explicit DAG: cycles are rejected at registration,
//! `start_all` runs a topological order, `stop_all` the reverse. A plugin
//! cannot start before its dependencies and cannot stop while a dependent
//! is still running.

mod context;
mod manager;
mod route;

pub use context::PluginContext;
pub use manager::{PluginInfo, PluginManager};
pub use route::{pattern_matches, MountEntry, PluginRoute, RouteAuth, RouteRule};

use noplacelike_core::service::BoxFuture;
use noplacelike_core::PlatformError;

/// Lifecycle state of a plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Registered,
    Initialized,
    Started,
    Stopped,
    Failed,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginState::Registered => "registered",
            PluginState::Initialized => "initialized",
            PluginState::Started => "started",
            PluginState::Stopped => "stopped",
            PluginState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// An in-process platform extension.
///
/// `initialize` receives the narrow platform surface ([`PluginContext`])
/// and may register subscriptions and resources, but must not serve
/// traffic until `start`. Routes are collected when the plugin starts and
/// fully torn down when it stops, so repeated start/stop cycles mount
/// cleanly.
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Semantic version, `major.minor.patch`.
    fn version(&self) -> &str;

    /// Names of plugins that must be started before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn initialize(&self, ctx: PluginContext) -> BoxFuture<'_, Result<(), PlatformError>>;

    fn start(&self) -> BoxFuture<'_, Result<(), PlatformError>>;

    fn stop(&self) -> BoxFuture<'_, Result<(), PlatformError>>;

    /// Routes mounted under `/plugins/{name}` while the plugin is started.
    fn routes(&self) -> Vec<PluginRoute> {
        Vec::new()
    }
}

/// Reject anything that is not `major.minor.patch` with numeric parts.
pub(crate) fn validate_semver(version: &str) -> Result<(), PlatformError> {
    let parts: Vec<&str> = version.split('.').collect();
    let numeric = parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.parse::<u64>().is_ok());
    if numeric {
        Ok(())
    } else {
        Err(PlatformError::InvalidRequest(format!(
            "invalid semver: {version}"
        )))
    }
}

#[cfg(test)]
mod semver_tests {
    use super::validate_semver;

    #[test]
    fn accepts_dotted_triples() {
        assert!(validate_semver("0.1.0").is_ok());
        assert!(validate_semver("12.34.56").is_ok());
    }

    #[test]
    fn rejects_everything_else() {
        assert!(validate_semver("1.0").is_err());
        assert!(validate_semver("1.0.0.0").is_err());
        assert!(validate_semver("1.a.0").is_err());
        assert!(validate_semver("").is_err());
    }
}
