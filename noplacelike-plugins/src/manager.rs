use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{HealthState, PlatformConfig, PlatformError, PlatformEvent, Service};
use noplacelike_events::{EventBus, Owner};
use noplacelike_resources::ResourceManager;

use crate::context::PluginContext;
use crate::route::MountEntry;
use crate::{validate_semver, Plugin, PluginState};

/// Backoff schedule between start retries.
const START_RETRIES: usize = 3;
const START_BACKOFF_CAP: Duration = Duration::from_secs(30);

fn start_backoff(attempt: usize) -> Duration {
    let secs = 1u64 << attempt.min(16);
    Duration::from_secs(secs).min(START_BACKOFF_CAP)
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    state: RwLock<PluginState>,
}

impl PluginEntry {
    fn state(&self) -> PluginState {
        *self.state.read().expect("plugin state poisoned")
    }

    fn set_state(&self, state: PluginState) {
        *self.state.write().expect("plugin state poisoned") = state;
    }
}

/// Introspection snapshot of one plugin.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub state: PluginState,
    pub routes: usize,
}

/// Owns every plugin object and drives the lifecycle DAG.
pub struct PluginManager {
    entries: RwLock<HashMap<String, Arc<PluginEntry>>>,
    /// Registration order; breaks topological ties deterministically.
    order: RwLock<Vec<String>>,
    mounts: RwLock<HashMap<String, Arc<MountEntry>>>,
    bus: Arc<EventBus>,
    resources: Arc<ResourceManager>,
    config: Arc<PlatformConfig>,
    running: AtomicBool,
}

impl PluginManager {
    pub fn new(
        bus: Arc<EventBus>,
        resources: Arc<ResourceManager>,
        config: Arc<PlatformConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            mounts: RwLock::new(HashMap::new()),
            bus,
            resources,
            config,
            running: AtomicBool::new(false),
        })
    }

    fn entry(&self, name: &str) -> Result<Arc<PluginEntry>, PlatformError> {
        self.entries
            .read()
            .expect("plugin table poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("plugin {name} not found")))
    }

    /// Register a plugin in the `Registered` state. Rejects duplicate
    /// names, malformed versions, and dependency cycles.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PlatformError> {
        let name = plugin.name().to_string();
        validate_semver(plugin.version())?;
        let mut entries = self.entries.write().expect("plugin table poisoned");
        if entries.contains_key(&name) {
            return Err(PlatformError::Conflict(format!(
                "plugin {name} is already registered"
            )));
        }
        Self::check_acyclic(&entries, &name, &plugin.dependencies())?;
        entries.insert(
            name.clone(),
            Arc::new(PluginEntry {
                plugin,
                state: RwLock::new(PluginState::Registered),
            }),
        );
        self.order.write().expect("plugin order poisoned").push(name);
        Ok(())
    }

    fn check_acyclic(
        entries: &HashMap<String, Arc<PluginEntry>>,
        candidate: &str,
        candidate_deps: &[String],
    ) -> Result<(), PlatformError> {
        // A new node can only close a cycle through its own dependencies,
        // so walk from the candidate and look for a path back to it.
        let mut stack: Vec<String> = candidate_deps.to_vec();
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == candidate {
                return Err(PlatformError::Conflict(format!(
                    "plugin {candidate} introduces a dependency cycle"
                )));
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(entry) = entries.get(&current) {
                stack.extend(entry.plugin.dependencies());
            }
        }
        Ok(())
    }

    /// Run the plugin's `initialize` hook. Valid from `Registered` and,
    /// for re-initialisation, from `Stopped`. Failure parks the plugin in
    /// `Failed`.
    pub async fn initialize(&self, name: &str) -> Result<(), PlatformError> {
        let entry = self.entry(name)?;
        match entry.state() {
            PluginState::Registered | PluginState::Stopped => {}
            state => {
                return Err(PlatformError::PreconditionFailed(format!(
                    "plugin {name} cannot initialize from state {state}"
                )));
            }
        }
        let ctx = PluginContext::new(
            name,
            self.bus.clone(),
            self.resources.clone(),
            self.config.clone(),
        );
        match entry.plugin.initialize(ctx).await {
            Ok(()) => {
                entry.set_state(PluginState::Initialized);
                info!(plugin = name, "plugin initialized");
                Ok(())
            }
            Err(err) => {
                entry.set_state(PluginState::Failed);
                error!(plugin = name, %err, "plugin initialize failed");
                Err(err)
            }
        }
    }

    /// Start a plugin: dependencies must already be `Started`. A failing
    /// start is retried with exponential backoff before the plugin is
    /// marked `Failed`.
    pub async fn start(&self, name: &str) -> Result<(), PlatformError> {
        let entry = self.entry(name)?;
        match entry.state() {
            PluginState::Initialized => {}
            PluginState::Started => return Ok(()),
            state => {
                return Err(PlatformError::PreconditionFailed(format!(
                    "plugin {name} cannot start from state {state}"
                )));
            }
        }
        for dep in entry.plugin.dependencies() {
            let dep_state = self.entry(&dep).map(|e| e.state());
            if !matches!(dep_state, Ok(PluginState::Started)) {
                return Err(PlatformError::PreconditionFailed(format!(
                    "plugin {name} requires dependency {dep} to be started"
                )));
            }
        }

        let mut attempt = 0;
        loop {
            match entry.plugin.start().await {
                Ok(()) => break,
                Err(err) if attempt < START_RETRIES => {
                    let backoff = start_backoff(attempt);
                    warn!(
                        plugin = name,
                        %err,
                        attempt = attempt + 1,
                        backoff_secs = backoff.as_secs(),
                        "plugin start failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    entry.set_state(PluginState::Failed);
                    error!(plugin = name, %err, "plugin start failed after retries");
                    return Err(err);
                }
            }
        }

        let mount = MountEntry::compile(entry.plugin.routes());
        self.mounts
            .write()
            .expect("mount table poisoned")
            .insert(name.to_string(), mount);
        entry.set_state(PluginState::Started);
        info!(plugin = name, "plugin started");
        self.announce("plugin.started", name);
        Ok(())
    }

    /// Stop a plugin. Refused with `Conflict` while any dependent plugin
    /// is still started. Routes, subscriptions, and resources are fully
    /// torn down, so a repeat start mounts cleanly.
    pub async fn stop(&self, name: &str) -> Result<(), PlatformError> {
        let entry = self.entry(name)?;
        if entry.state() != PluginState::Started {
            return Err(PlatformError::PreconditionFailed(format!(
                "plugin {name} is not started"
            )));
        }
        let dependents = self.started_dependents(name);
        if !dependents.is_empty() {
            return Err(PlatformError::Conflict(format!(
                "plugin {name} still has started dependents: {}",
                dependents.join(", ")
            )));
        }
        self.stop_unchecked(name, &entry).await;
        Ok(())
    }

    async fn stop_unchecked(&self, name: &str, entry: &Arc<PluginEntry>) {
        if let Err(err) = entry.plugin.stop().await {
            warn!(plugin = name, %err, "plugin stop reported error");
        }
        self.mounts
            .write()
            .expect("mount table poisoned")
            .remove(name);
        self.bus.unsubscribe_owner(&Owner::Plugin(name.to_string()));
        self.resources.unregister_provider(name);
        entry.set_state(PluginState::Stopped);
        info!(plugin = name, "plugin stopped");
        self.announce("plugin.stopped", name);
    }

    fn started_dependents(&self, name: &str) -> Vec<String> {
        self.entries
            .read()
            .expect("plugin table poisoned")
            .iter()
            .filter(|(_, e)| {
                e.state() == PluginState::Started
                    && e.plugin.dependencies().iter().any(|d| d == name)
            })
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Full load protocol: register, initialize, and, when the platform is
    /// already running, start. Publishes `plugin.loaded` on success.
    pub async fn load(&self, plugin: Arc<dyn Plugin>) -> Result<(), PlatformError> {
        let name = plugin.name().to_string();
        self.register(plugin)?;
        self.initialize(&name).await?;
        if self.running.load(Ordering::Acquire) {
            self.start(&name).await?;
        }
        self.announce("plugin.loaded", &name);
        Ok(())
    }

    /// Unload: stop (refused while dependents run) and forget the plugin.
    pub async fn unload(&self, name: &str) -> Result<(), PlatformError> {
        let entry = self.entry(name)?;
        if entry.state() == PluginState::Started {
            self.stop(name).await?;
        }
        self.entries
            .write()
            .expect("plugin table poisoned")
            .remove(name);
        self.order
            .write()
            .expect("plugin order poisoned")
            .retain(|n| n != name);
        self.announce("plugin.unloaded", name);
        Ok(())
    }

    /// Initialize every `Registered` plugin in dependency order. A plugin
    /// whose initialize fails stays `Failed`; the rest continue.
    pub async fn initialize_all(&self) {
        for name in self.topological_order() {
            let Ok(entry) = self.entry(&name) else { continue };
            if entry.state() == PluginState::Registered {
                let _ = self.initialize(&name).await;
            }
        }
    }

    /// Start every `Initialized` plugin in dependency order. Failed
    /// plugins are excluded; plugins whose dependencies failed are
    /// skipped with a warning.
    pub async fn start_all(&self) {
        self.running.store(true, Ordering::Release);
        for name in self.topological_order() {
            let Ok(entry) = self.entry(&name) else { continue };
            if entry.state() != PluginState::Initialized {
                continue;
            }
            if let Err(err) = self.start(&name).await {
                warn!(plugin = %name, %err, "plugin excluded from startup");
            }
        }
    }

    /// Stop every started plugin in reverse dependency order.
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::Release);
        for name in self.topological_order().into_iter().rev() {
            let Ok(entry) = self.entry(&name) else { continue };
            if entry.state() == PluginState::Started {
                self.stop_unchecked(&name, &entry).await;
            }
        }
    }

    /// Registration-order-stable topological sort. Edges to unknown
    /// plugins are ignored here; `start` still refuses to run without
    /// them.
    fn topological_order(&self) -> Vec<String> {
        let entries = self.entries.read().expect("plugin table poisoned");
        let order = self.order.read().expect("plugin order poisoned").clone();

        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &order {
            indegree.entry(name.as_str()).or_insert(0);
        }
        for name in &order {
            let Some(entry) = entries.get(name) else { continue };
            for dep in entry.plugin.dependencies() {
                if let Some((dep_key, _)) = entries.get_key_value(&dep) {
                    *indegree.entry(name.as_str()).or_insert(0) += 1;
                    dependents.entry(dep_key.as_str()).or_default().push(name);
                }
            }
        }
        let mut queue: VecDeque<&str> = order
            .iter()
            .map(|n| n.as_str())
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(order.len());
        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());
            for dependent in dependents.get(name).cloned().unwrap_or_default() {
                let slot = indegree.get_mut(dependent).expect("known plugin");
                *slot -= 1;
                if *slot == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        sorted
    }

    /// The mounted surface of a started plugin, for front-door dispatch.
    pub fn mounted(&self, name: &str) -> Option<Arc<MountEntry>> {
        self.mounts
            .read()
            .expect("mount table poisoned")
            .get(name)
            .cloned()
    }

    pub fn info(&self, name: &str) -> Option<PluginInfo> {
        let entries = self.entries.read().expect("plugin table poisoned");
        entries.get(name).map(|e| PluginInfo {
            name: name.to_string(),
            version: e.plugin.version().to_string(),
            dependencies: e.plugin.dependencies(),
            state: e.state(),
            routes: e.plugin.routes().len(),
        })
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        let order = self.order.read().expect("plugin order poisoned").clone();
        order.iter().filter_map(|n| self.info(n)).collect()
    }

    pub fn started_count(&self) -> usize {
        self.entries
            .read()
            .expect("plugin table poisoned")
            .values()
            .filter(|e| e.state() == PluginState::Started)
            .count()
    }

    fn announce(&self, event_type: &str, plugin: &str) {
        let event = PlatformEvent::new(
            event_type,
            "platform",
            serde_json::json!({ "name": plugin }),
        );
        if let Err(err) = self.bus.publish(event) {
            warn!(%err, event_type, "failed to announce plugin lifecycle");
        }
    }
}

impl Service for PluginManager {
    fn name(&self) -> &str {
        "plugins"
    }

    fn depends_on(&self) -> Vec<String> {
        vec!["event-bus".to_string(), "resources".to_string()]
    }

    fn start(&self, _shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.initialize_all().await;
            self.start_all().await;
            Ok(())
        })
    }

    fn stop(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.stop_all().await;
            Ok(())
        })
    }

    /// Unhealthy when every plugin failed, degraded when any did.
    fn health(&self) -> BoxFuture<'_, HealthState> {
        Box::pin(async move {
            let failed: Vec<String> = self
                .entries
                .read()
                .expect("plugin table poisoned")
                .iter()
                .filter(|(_, e)| e.state() == PluginState::Failed)
                .map(|(n, _)| n.clone())
                .collect();
            if failed.is_empty() {
                HealthState::Healthy
            } else {
                HealthState::Degraded(format!("failed plugins: {}", failed.join(", ")))
            }
        })
    }
}
