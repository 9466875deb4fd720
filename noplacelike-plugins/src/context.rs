use std::sync::Arc;

use noplacelike_core::{PlatformConfig, PlatformError, PlatformEvent};
use noplacelike_events::{EventBus, EventHandler, Owner, SubscriptionId};
use noplacelike_resources::{ResourceDescriptor, ResourceManager, StreamOpener};

/// The narrow platform surface a plugin sees.
///
/// Deliberately smaller than the managers behind it: a plugin can publish
/// and subscribe, own resources, and read configuration. Everything is
/// attributed to the plugin, so stopping it tears its subscriptions and
/// resources down in one step.
#[derive(Clone)]
pub struct PluginContext {
    plugin: String,
    bus: Arc<EventBus>,
    resources: Arc<ResourceManager>,
    config: Arc<PlatformConfig>,
}

impl PluginContext {
    pub(crate) fn new(
        plugin: &str,
        bus: Arc<EventBus>,
        resources: Arc<ResourceManager>,
        config: Arc<PlatformConfig>,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            bus,
            resources,
            config,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Publish an event attributed to this plugin.
    pub fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), PlatformError> {
        self.bus
            .publish(PlatformEvent::new(event_type, self.plugin.clone(), payload))
            .map_err(PlatformError::from)
    }

    /// Subscribe to a pattern; the subscription is owned by this plugin
    /// and removed when it stops.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionId, PlatformError> {
        self.bus
            .subscribe(pattern, Owner::Plugin(self.plugin.clone()), handler)
            .map_err(PlatformError::from)
    }

    /// Register a resource provided by this plugin.
    pub fn register_resource(
        &self,
        descriptor: ResourceDescriptor,
        opener: StreamOpener,
    ) -> Result<(), PlatformError> {
        self.resources.register(descriptor, &self.plugin, opener)
    }

    pub fn unregister_resource(&self, id: &str) {
        self.resources.unregister(id);
    }
}
