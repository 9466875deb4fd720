//! Resource registry.
//!
//! A resource is a named, typed, streamable object exposed by a provider
//! (the platform or a plugin). The registry owns only the bookkeeping;
//! the bytes stay with the provider and are pulled through a cursor
//! opened on demand. Registration and withdrawal are announced on the
//! event bus as `resource.added` / `resource.removed`, which is how the
//! peer layer decides what to announce to other instances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{HealthState, PlatformError, PlatformEvent, Service};
use noplacelike_events::EventBus;

/// Descriptor snapshot handed to consumers. The registry never exposes
/// live records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Single-reader cursor over a resource's bytes.
///
/// `read` yields `Ok(Some(chunk))` until the end of the stream, then
/// `Ok(None)`. Mid-stream provider failures surface as `Err` on the next
/// read. `close` releases provider-side resources and is idempotent.
pub trait ResourceReader: Send + std::fmt::Debug {
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, PlatformError>>;
    fn close(&mut self);
}

/// Capability to open a fresh cursor on a resource.
pub type StreamOpener = Arc<
    dyn Fn() -> BoxFuture<'static, Result<Box<dyn ResourceReader>, PlatformError>> + Send + Sync,
>;

struct ResourceRecord {
    descriptor: ResourceDescriptor,
    opener: StreamOpener,
    provider: String,
}

/// Filter for `list`. Empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct ResourceFilter {
    pub kind: Option<String>,
    pub provider: Option<String>,
    /// Metadata keys the resource must carry.
    pub metadata_keys: Vec<String>,
}

impl ResourceFilter {
    fn matches(&self, record: &ResourceRecord) -> bool {
        if let Some(kind) = &self.kind {
            if &record.descriptor.kind != kind {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &record.provider != provider {
                return false;
            }
        }
        self.metadata_keys
            .iter()
            .all(|k| record.descriptor.metadata.contains_key(k))
    }
}

pub struct ResourceManager {
    registry: RwLock<HashMap<String, ResourceRecord>>,
    bus: Arc<EventBus>,
}

impl ResourceManager {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            bus,
        })
    }

    /// Register a resource. A live id cannot be re-registered.
    pub fn register(
        &self,
        descriptor: ResourceDescriptor,
        provider: &str,
        opener: StreamOpener,
    ) -> Result<(), PlatformError> {
        let event_payload = serde_json::to_value(&descriptor)?;
        let id = descriptor.id.clone();
        {
            let mut registry = self.registry.write().expect("resource registry poisoned");
            if registry.contains_key(&id) {
                return Err(PlatformError::Conflict(format!(
                    "resource {id} is already registered"
                )));
            }
            registry.insert(
                id.clone(),
                ResourceRecord {
                    descriptor,
                    opener,
                    provider: provider.to_string(),
                },
            );
        }
        debug!(resource = %id, provider, "resource registered");
        self.announce("resource.added", event_payload);
        Ok(())
    }

    /// Remove a resource. Removing an unknown id is a no-op.
    pub fn unregister(&self, id: &str) {
        let removed = self
            .registry
            .write()
            .expect("resource registry poisoned")
            .remove(id);
        if let Some(record) = removed {
            debug!(resource = id, "resource unregistered");
            if let Ok(payload) = serde_json::to_value(&record.descriptor) {
                self.announce("resource.removed", payload);
            }
        }
    }

    /// Remove everything a provider registered; used when the provider
    /// stops.
    pub fn unregister_provider(&self, provider: &str) {
        let removed: Vec<ResourceDescriptor> = {
            let mut registry = self.registry.write().expect("resource registry poisoned");
            let ids: Vec<String> = registry
                .iter()
                .filter(|(_, r)| r.provider == provider)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| registry.remove(&id))
                .map(|r| r.descriptor)
                .collect()
        };
        for descriptor in removed {
            if let Ok(payload) = serde_json::to_value(&descriptor) {
                self.announce("resource.removed", payload);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ResourceDescriptor> {
        self.registry
            .read()
            .expect("resource registry poisoned")
            .get(id)
            .map(|r| r.descriptor.clone())
    }

    pub fn list(&self, filter: &ResourceFilter) -> Vec<ResourceDescriptor> {
        let mut out: Vec<ResourceDescriptor> = self
            .registry
            .read()
            .expect("resource registry poisoned")
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| r.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn count(&self) -> usize {
        self.registry
            .read()
            .expect("resource registry poisoned")
            .len()
    }

    /// Open a cursor on the resource's bytes.
    pub async fn open_stream(&self, id: &str) -> Result<Box<dyn ResourceReader>, PlatformError> {
        let opener = {
            let registry = self.registry.read().expect("resource registry poisoned");
            let record = registry
                .get(id)
                .ok_or_else(|| PlatformError::NotFound(format!("resource {id} not found")))?;
            record.opener.clone()
        };
        opener().await
    }

    fn announce(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(err) = self
            .bus
            .publish(PlatformEvent::new(event_type, "platform", payload))
        {
            warn!(%err, event_type, "failed to announce resource change");
        }
    }
}

impl Service for ResourceManager {
    fn name(&self) -> &str {
        "resources"
    }

    fn depends_on(&self) -> Vec<String> {
        vec!["event-bus".to_string()]
    }

    fn start(&self, _shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            // Providers already withdrew their resources when they
            // stopped; anything left goes quietly.
            self.registry
                .write()
                .expect("resource registry poisoned")
                .clear();
            Ok(())
        })
    }

    fn health(&self) -> BoxFuture<'_, HealthState> {
        Box::pin(async { HealthState::Healthy })
    }
}

// ── In-memory provider ─────────────────────────────────────────────────────

const MEMORY_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
struct MemoryReader {
    data: Bytes,
    pos: usize,
    closed: bool,
}

impl ResourceReader for MemoryReader {
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, PlatformError>> {
        Box::pin(async move {
            if self.closed || self.pos >= self.data.len() {
                return Ok(None);
            }
            let end = (self.pos + MEMORY_CHUNK).min(self.data.len());
            let chunk = self.data.slice(self.pos..end);
            self.pos = end;
            Ok(Some(chunk))
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Opener over an in-memory blob; clipboard-style resources and the HTTP
/// registry CRUD use this.
pub fn memory_opener(data: Bytes) -> StreamOpener {
    Arc::new(move || {
        let data = data.clone();
        Box::pin(async move {
            Ok(Box::new(MemoryReader {
                data,
                pos: 0,
                closed: false,
            }) as Box<dyn ResourceReader>)
        })
    })
}
