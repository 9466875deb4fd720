//! Ordered start/stop of platform services.
//!
//! Services declare dependencies by name; `start_all` runs a topological
//! order (registration order breaks ties) and rolls the already-started
//! prefix back, in reverse, when any start fails. `stop_all` is the exact
//! reverse of the observed start order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PlatformError;
use crate::service::{HealthState, Service};

/// Aggregated platform health, as reported by `GET /health`.
#[derive(Clone, Debug, Serialize)]
pub struct AggregatedHealth {
    pub status: HealthState,
    pub services: Vec<ServiceReport>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceReport {
    pub name: String,
    #[serde(flatten)]
    pub state: HealthState,
}

pub struct ServiceManager {
    services: RwLock<Vec<Arc<dyn Service>>>,
    started: Mutex<Vec<String>>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the platform shuts down. Services receive a
    /// child of this token from `start`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a service. Duplicate names and dependency cycles are
    /// rejected with `Conflict`. When the platform is already running the
    /// service is started immediately.
    pub async fn register(&self, service: Arc<dyn Service>) -> Result<(), PlatformError> {
        {
            let mut services = self.services.write().expect("service table poisoned");
            if services.iter().any(|s| s.name() == service.name()) {
                return Err(PlatformError::Conflict(format!(
                    "service {} is already registered",
                    service.name()
                )));
            }
            Self::check_acyclic(&services, &service)?;
            services.push(service.clone());
        }
        if self.is_running() {
            info!(service = service.name(), "starting late-registered service");
            service.start(self.shutdown.child_token()).await?;
            self.started
                .lock()
                .expect("started list poisoned")
                .push(service.name().to_string());
        }
        Ok(())
    }

    /// Reject registration when `candidate` would close a dependency cycle.
    fn check_acyclic(
        existing: &[Arc<dyn Service>],
        candidate: &Arc<dyn Service>,
    ) -> Result<(), PlatformError> {
        let mut deps: HashMap<String, Vec<String>> = existing
            .iter()
            .map(|s| (s.name().to_string(), s.depends_on()))
            .collect();
        deps.insert(candidate.name().to_string(), candidate.depends_on());

        // DFS from the candidate; a path back to it is a cycle.
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        fn visit(
            name: &str,
            deps: &HashMap<String, Vec<String>>,
            visiting: &mut HashSet<String>,
            visited: &mut HashSet<String>,
        ) -> bool {
            if visited.contains(name) {
                return true;
            }
            if !visiting.insert(name.to_string()) {
                return false;
            }
            if let Some(children) = deps.get(name) {
                for child in children {
                    if !visit(child, deps, visiting, visited) {
                        return false;
                    }
                }
            }
            visiting.remove(name);
            visited.insert(name.to_string());
            true
        }
        if !visit(candidate.name(), &deps, &mut visiting, &mut visited) {
            return Err(PlatformError::Conflict(format!(
                "service {} introduces a dependency cycle",
                candidate.name()
            )));
        }
        Ok(())
    }

    /// Dependency-respecting order over all registered services.
    fn topological_order(&self) -> Result<Vec<Arc<dyn Service>>, PlatformError> {
        let services = self
            .services
            .read()
            .expect("service table poisoned")
            .clone();
        let names: HashSet<&str> = services.iter().map(|s| s.name()).collect();
        for service in &services {
            for dep in service.depends_on() {
                if !names.contains(dep.as_str()) {
                    return Err(PlatformError::Conflict(format!(
                        "service {} depends on unregistered service {dep}",
                        service.name()
                    )));
                }
            }
        }

        // Kahn's algorithm; ready services are taken in registration order.
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for service in &services {
            indegree.entry(service.name()).or_insert(0);
        }
        for service in &services {
            for dep in service.depends_on() {
                let dep = services
                    .iter()
                    .find(|s| s.name() == dep)
                    .expect("dependency checked above")
                    .name();
                *indegree.entry(service.name()).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(service.name());
            }
        }
        let mut queue: VecDeque<&str> = services
            .iter()
            .map(|s| s.name())
            .filter(|n| indegree[*n] == 0)
            .collect();
        let mut order = Vec::with_capacity(services.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for dependent in dependents.get(name).cloned().unwrap_or_default() {
                let entry = indegree.get_mut(dependent).expect("known service");
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if order.len() != services.len() {
            return Err(PlatformError::Conflict(
                "service dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(order
            .into_iter()
            .map(|n| {
                services
                    .iter()
                    .find(|s| s.name() == n)
                    .expect("ordered name")
                    .clone()
            })
            .collect())
    }

    /// Start every registered service in dependency order. On failure the
    /// already-started prefix is stopped in reverse and the error returned.
    pub async fn start_all(&self) -> Result<(), PlatformError> {
        if self.is_running() {
            return Ok(());
        }
        let order = self.topological_order()?;
        let mut started: Vec<Arc<dyn Service>> = Vec::new();
        for service in order {
            info!(service = service.name(), "starting service");
            match service.start(self.shutdown.child_token()).await {
                Ok(()) => started.push(service),
                Err(err) => {
                    error!(service = service.name(), %err, "service failed to start, rolling back");
                    for prev in started.iter().rev() {
                        if let Err(stop_err) = prev.stop(Duration::from_secs(5)).await {
                            warn!(service = prev.name(), %stop_err, "rollback stop failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        *self.started.lock().expect("started list poisoned") =
            started.iter().map(|s| s.name().to_string()).collect();
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop all started services in reverse start order. Each stop is
    /// bounded by `deadline` plus a small grace for the forced-close path.
    pub async fn stop_all(&self, deadline: Duration) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let started = std::mem::take(&mut *self.started.lock().expect("started list poisoned"));
        let services = self
            .services
            .read()
            .expect("service table poisoned")
            .clone();
        for name in started.iter().rev() {
            let Some(service) = services.iter().find(|s| s.name() == name.as_str()) else {
                continue;
            };
            info!(service = name.as_str(), "stopping service");
            let bounded = deadline + Duration::from_millis(100);
            match tokio::time::timeout(bounded, service.stop(deadline)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(service = name.as_str(), %err, "service stop reported error"),
                Err(_) => error!(service = name.as_str(), "service stop exceeded deadline"),
            }
        }
    }

    /// Health of every registered service plus the aggregate:
    /// all healthy, any degraded, or any unhealthy, in that precedence.
    pub async fn health(&self) -> AggregatedHealth {
        let services = self
            .services
            .read()
            .expect("service table poisoned")
            .clone();
        let mut reports = Vec::with_capacity(services.len());
        let mut degraded = None;
        let mut unhealthy = None;
        for service in &services {
            let state = service.health().await;
            match &state {
                HealthState::Degraded(reason) if degraded.is_none() => {
                    degraded = Some(format!("{}: {reason}", service.name()));
                }
                HealthState::Unhealthy(reason) if unhealthy.is_none() => {
                    unhealthy = Some(format!("{}: {reason}", service.name()));
                }
                _ => {}
            }
            reports.push(ServiceReport {
                name: service.name().to_string(),
                state,
            });
        }
        let status = if let Some(reason) = unhealthy {
            HealthState::Unhealthy(reason)
        } else if let Some(reason) = degraded {
            HealthState::Degraded(reason)
        } else {
            HealthState::Healthy
        };
        AggregatedHealth {
            status,
            services: reports,
        }
    }

    /// Names and configuration schemas, for introspection endpoints.
    pub fn service_schemas(&self) -> Vec<(String, serde_json::Value)> {
        self.services
            .read()
            .expect("service table poisoned")
            .iter()
            .map(|s| (s.name().to_string(), s.config_schema()))
            .collect()
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::BoxFuture;

    struct RecorderService {
        name: String,
        deps: Vec<String>,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
        health: HealthState,
    }

    impl RecorderService {
        fn new(name: &str, deps: &[&str], log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                log,
                fail_start: false,
                health: HealthState::Healthy,
            })
        }

        fn failing(name: &str, deps: &[&str], log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                log,
                fail_start: true,
                health: HealthState::Healthy,
            })
        }
    }

    impl Service for RecorderService {
        fn name(&self) -> &str {
            &self.name
        }

        fn depends_on(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn start(&self, _shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
            Box::pin(async move {
                if self.fail_start {
                    return Err(PlatformError::Internal(format!("{} refused", self.name)));
                }
                self.log.lock().unwrap().push(format!("start:{}", self.name));
                Ok(())
            })
        }

        fn stop(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("stop:{}", self.name));
                Ok(())
            })
        }

        fn health(&self) -> BoxFuture<'_, HealthState> {
            Box::pin(async move { self.health.clone() })
        }
    }

    #[tokio::test]
    async fn start_all_respects_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        // Registered out of order on purpose.
        mgr.register(RecorderService::new("c", &["b"], log.clone()))
            .await
            .unwrap();
        mgr.register(RecorderService::new("a", &[], log.clone()))
            .await
            .unwrap();
        mgr.register(RecorderService::new("b", &["a"], log.clone()))
            .await
            .unwrap();

        mgr.start_all().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "start:c"]
        );

        mgr.stop_all(Duration::from_secs(1)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn failed_start_rolls_back_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        mgr.register(RecorderService::new("a", &[], log.clone()))
            .await
            .unwrap();
        mgr.register(RecorderService::new("b", &["a"], log.clone()))
            .await
            .unwrap();
        mgr.register(RecorderService::failing("c", &["b"], log.clone()))
            .await
            .unwrap();

        let err = mgr.start_all().await.unwrap_err();
        assert!(err.to_string().contains("c refused"));
        assert!(!mgr.is_running());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn cycle_is_rejected_at_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        mgr.register(RecorderService::new("a", &["b"], log.clone()))
            .await
            .unwrap();
        let err = mgr
            .register(RecorderService::new("b", &["a"], log.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        mgr.register(RecorderService::new("a", &[], log.clone()))
            .await
            .unwrap();
        let err = mgr
            .register(RecorderService::new("a", &[], log.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_dependency_fails_start_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        mgr.register(RecorderService::new("a", &["ghost"], log.clone()))
            .await
            .unwrap();
        let err = mgr.start_all().await.unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_while_running_starts_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        mgr.register(RecorderService::new("a", &[], log.clone()))
            .await
            .unwrap();
        mgr.start_all().await.unwrap();

        mgr.register(RecorderService::new("late", &[], log.clone()))
            .await
            .unwrap();
        assert!(log.lock().unwrap().contains(&"start:late".to_string()));

        mgr.stop_all(Duration::from_secs(1)).await;
        // The late service stops first: it started last.
        let entries = log.lock().unwrap();
        let stop_late = entries.iter().position(|e| e == "stop:late").unwrap();
        let stop_a = entries.iter().position(|e| e == "stop:a").unwrap();
        assert!(stop_late < stop_a);
    }

    #[tokio::test]
    async fn health_aggregates_worst_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = ServiceManager::new();
        mgr.register(RecorderService::new("a", &[], log.clone()))
            .await
            .unwrap();
        mgr.register(Arc::new(RecorderService {
            name: "b".to_string(),
            deps: Vec::new(),
            log: log.clone(),
            fail_start: false,
            health: HealthState::Degraded("drops observed".to_string()),
        }))
        .await
        .unwrap();

        let health = mgr.health().await;
        assert!(matches!(health.status, HealthState::Degraded(_)));
        assert_eq!(health.services.len(), 2);
    }
}
