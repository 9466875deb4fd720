//! In-process event bus with topic and wildcard subscription.
//!
//! Events carry a dot-separated hierarchical type (`peer.left`,
//! `resource.added`). Subscribers match it exactly, by prefix (`peer.*`),
//! or with the universal wildcard `*`.
//!
//! Publication is fire-and-forget: matching subscriptions are resolved
//! against a copy-on-write snapshot and the event is pushed onto each
//! subscription's bounded queue. A dedicated worker task per subscription
//! drains the queue, so delivery order per (publisher, subscriber) is the
//! publication order and a handler never runs on the publisher's stack.
//!
//! When a queue is full the oldest entry is dropped and counted; the
//! publisher is never blocked and other subscriptions see no drops.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{HealthState, PlatformError, PlatformEvent, Service};

/// Default per-subscription buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// A subscription pattern: exact type, hierarchical prefix, or everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    /// Stored with the trailing dot, e.g. `network.` for `network.*`.
    Prefix(String),
    All,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Pattern::All
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Pattern::Prefix(format!("{prefix}."))
        } else {
            Pattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Exact(t) => t == event_type,
            Pattern::Prefix(p) => event_type.starts_with(p.as_str()),
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::All => write!(f, "*"),
            Pattern::Exact(t) => write!(f, "{t}"),
            Pattern::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

/// Who owns a subscription. All subscriptions of an owner are removed
/// atomically when the owner stops.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Platform,
    Plugin(String),
    Peer(String),
    /// A live client connection, e.g. one SSE stream.
    Connection(String),
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Platform => write!(f, "platform"),
            Owner::Plugin(name) => write!(f, "plugin:{name}"),
            Owner::Peer(id) => write!(f, "peer:{id}"),
            Owner::Connection(id) => write!(f, "connection:{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type EventHandler =
    Arc<dyn Fn(Arc<PlatformEvent>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Bus-local failures.
#[derive(Debug, PartialEq, Eq)]
pub enum BusError {
    /// `publish` or `subscribe` after `stop`.
    Stopped,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Stopped => write!(f, "event bus is stopped"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<BusError> for PlatformError {
    fn from(err: BusError) -> Self {
        PlatformError::Unavailable(err.to_string())
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: Pattern,
    owner: Owner,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<PlatformEvent>>>,
    notify: Notify,
    cancel: CancellationToken,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
}

impl Subscription {
    /// Push an event, evicting the oldest entry when full.
    /// Returns true when an eviction happened.
    fn enqueue(&self, event: Arc<PlatformEvent>) -> bool {
        let evicted = {
            let mut queue = self.queue.lock().expect("subscription queue poisoned");
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }
}

/// Introspection snapshot of one subscription.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub pattern: String,
    pub owner: String,
    pub queued: usize,
    pub dropped: u64,
    pub handler_errors: u64,
}

pub struct EventBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    workers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    capacity: usize,
    stopped: AtomicBool,
    published: AtomicU64,
    dropped_total: AtomicU64,
    drops_at_last_check: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Per-subscription buffer capacity before drop-oldest applies.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            stopped: AtomicBool::new(false),
            published: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            drops_at_last_check: AtomicU64::new(0),
        }
    }

    /// Register a handler for the given pattern. The worker task driving
    /// the handler is spawned here, so a runtime must be current.
    pub fn subscribe(
        &self,
        pattern: &str,
        owner: Owner,
        handler: EventHandler,
    ) -> Result<SubscriptionId, BusError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        let subscription = Arc::new(Subscription {
            id: SubscriptionId(Uuid::new_v4()),
            pattern: Pattern::parse(pattern),
            owner,
            capacity: self.capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            dropped: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        });
        let worker = tokio::spawn(Self::drain(subscription.clone(), handler));
        self.workers
            .lock()
            .expect("worker table poisoned")
            .insert(subscription.id, worker);
        let id = subscription.id;
        self.subscriptions
            .write()
            .expect("subscription table poisoned")
            .push(subscription);
        Ok(id)
    }

    /// Per-subscription worker: drains the queue in order, isolating
    /// handler panics so one bad delivery cannot stop the subscription.
    async fn drain(subscription: Arc<Subscription>, handler: EventHandler) {
        loop {
            let next = {
                let mut queue = subscription
                    .queue
                    .lock()
                    .expect("subscription queue poisoned");
                queue.pop_front()
            };
            match next {
                Some(event) => {
                    let fut = handler(event);
                    if tokio::spawn(fut).await.is_err() {
                        subscription.handler_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscription = %subscription.id,
                            owner = %subscription.owner,
                            "event handler panicked"
                        );
                    }
                }
                None => {
                    tokio::select! {
                        _ = subscription.cancel.cancelled() => break,
                        _ = subscription.notify.notified() => {}
                    }
                }
            }
            if subscription.cancel.is_cancelled() {
                break;
            }
        }
    }

    /// Publish an event to every matching subscription.
    ///
    /// Never blocks on slow subscribers: full queues evict their oldest
    /// entry. Subscriptions cancelled mid-dispatch are skipped silently.
    pub fn publish(&self, event: PlatformEvent) -> Result<(), BusError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);
        let snapshot = self
            .subscriptions
            .read()
            .expect("subscription table poisoned")
            .clone();
        for subscription in snapshot {
            if subscription.cancel.is_cancelled() {
                continue;
            }
            if subscription.pattern.matches(&event.event_type) {
                if subscription.enqueue(event.clone()) {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subscription = %subscription.id,
                        owner = %subscription.owner,
                        "dropped oldest buffered event"
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove one subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = {
            let mut subscriptions = self
                .subscriptions
                .write()
                .expect("subscription table poisoned");
            let before = subscriptions.len();
            subscriptions.retain(|s| {
                if s.id == id {
                    s.cancel.cancel();
                    false
                } else {
                    true
                }
            });
            before != subscriptions.len()
        };
        if removed {
            self.workers
                .lock()
                .expect("worker table poisoned")
                .remove(&id);
        }
    }

    /// Atomically remove every subscription belonging to `owner`.
    pub fn unsubscribe_owner(&self, owner: &Owner) {
        let removed: Vec<SubscriptionId> = {
            let mut subscriptions = self
                .subscriptions
                .write()
                .expect("subscription table poisoned");
            let mut removed = Vec::new();
            subscriptions.retain(|s| {
                if &s.owner == owner {
                    s.cancel.cancel();
                    removed.push(s.id);
                    false
                } else {
                    true
                }
            });
            removed
        };
        let mut workers = self.workers.lock().expect("worker table poisoned");
        for id in removed {
            workers.remove(&id);
        }
    }

    /// Stop the bus: no further publishes are accepted and every worker
    /// is drained within `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions = {
            let mut table = self
                .subscriptions
                .write()
                .expect("subscription table poisoned");
            std::mem::take(&mut *table)
        };
        for subscription in &subscriptions {
            subscription.cancel.cancel();
        }
        let workers = {
            let mut workers = self.workers.lock().expect("worker table poisoned");
            std::mem::take(&mut *workers)
        };
        for (id, worker) in workers {
            if tokio::time::timeout(deadline, worker).await.is_err() {
                warn!(subscription = %id, "event worker did not stop before deadline");
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .expect("subscription table poisoned")
            .len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .read()
            .expect("subscription table poisoned")
            .iter()
            .map(|s| SubscriptionInfo {
                id: s.id.to_string(),
                pattern: s.pattern.to_string(),
                owner: s.owner.to_string(),
                queued: s.queue.lock().expect("subscription queue poisoned").len(),
                dropped: s.dropped.load(Ordering::Relaxed),
                handler_errors: s.handler_errors.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for EventBus {
    fn name(&self) -> &str {
        "event-bus"
    }

    fn start(&self, _shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self, deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.shutdown(deadline).await;
            Ok(())
        })
    }

    /// Degraded while any subscription dropped deliveries since the last
    /// health check.
    fn health(&self) -> BoxFuture<'_, HealthState> {
        Box::pin(async move {
            let total = self.dropped_total.load(Ordering::Relaxed);
            let last = self.drops_at_last_check.swap(total, Ordering::Relaxed);
            if total > last {
                HealthState::Degraded(format!(
                    "{} deliveries dropped since last check",
                    total - last
                ))
            } else {
                HealthState::Healthy
            }
        })
    }
}
