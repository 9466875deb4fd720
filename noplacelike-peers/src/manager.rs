use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{HealthState, PlatformConfig, PlatformError, PlatformEvent, Service};
use noplacelike_events::{EventBus, Owner, SubscriptionId};
use noplacelike_security::ChannelCrypto;

use crate::channel::{spawn_channel, ChannelHandle, ChannelSignal};
use crate::peer::{
    DiscoveryFrame, PeerDescriptor, PeerEntry, PeerInfo, PeerMessage, PeerState, DISCOVER,
    DISCOVER_RESPONSE,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ORIGIN_KEY: &str = "origin";

/// Handler for application-defined message types arriving on channels.
pub type MessageHandler =
    Arc<dyn Fn(PeerMessage) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;

/// Network timings and ports, lifted out of [`PlatformConfig`] so tests
/// can shrink them.
#[derive(Clone, Debug)]
pub struct PeerNetConfig {
    pub discovery_port: u16,
    pub channel_port: u16,
    pub broadcast_addr: String,
    pub discovery_interval: Duration,
    pub discovery_window: Duration,
    pub keep_alive: Duration,
    pub grace: Duration,
    pub write_timeout: Duration,
}

impl PeerNetConfig {
    pub fn from_platform(config: &PlatformConfig) -> Self {
        Self {
            discovery_port: config.discovery.port,
            channel_port: config.peers.port,
            broadcast_addr: config.discovery.broadcast_addr.clone(),
            discovery_interval: Duration::from_secs(config.discovery.interval_secs),
            discovery_window: Duration::from_secs(config.discovery.response_window_secs),
            keep_alive: Duration::from_secs(config.peers.keep_alive_secs),
            grace: Duration::from_secs(config.peers.grace_secs),
            write_timeout: Duration::from_secs(config.peers.write_timeout_secs),
        }
    }
}

/// Discovers other instances on the LAN, tracks their liveness, and
/// multiplexes messages over per-peer channels.
///
/// The manager is the exclusive owner of the peer table and of every
/// channel; readers only ever get [`PeerInfo`] snapshots.
pub struct PeerManager {
    weak: Weak<PeerManager>,
    local: RwLock<PeerDescriptor>,
    net: PeerNetConfig,
    bus: Arc<EventBus>,
    crypto: Option<Arc<ChannelCrypto>>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    signals: Mutex<Option<mpsc::Sender<ChannelSignal>>>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    discovery_target: RwLock<Option<SocketAddr>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bridge_sub: Mutex<Option<SubscriptionId>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl PeerManager {
    pub fn new(
        local: PeerDescriptor,
        net: PeerNetConfig,
        bus: Arc<EventBus>,
        crypto: Option<Arc<ChannelCrypto>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            local: RwLock::new(local),
            net,
            bus,
            crypto,
            peers: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            signals: Mutex::new(None),
            udp: Mutex::new(None),
            discovery_target: RwLock::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            bridge_sub: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("manager alive while running")
    }

    pub fn local_descriptor(&self) -> PeerDescriptor {
        self.local.read().expect("local descriptor poisoned").clone()
    }

    /// Record the HTTP port actually bound, advertised in discovery
    /// frames from then on. Matters when the configured port was 0.
    pub fn set_local_http_port(&self, port: u16) {
        self.local.write().expect("local descriptor poisoned").port = port;
    }

    /// Where `discover` datagrams are sent. Defaults to the configured
    /// broadcast address; tests point it at a concrete instance.
    pub fn set_discovery_target(&self, target: SocketAddr) {
        *self
            .discovery_target
            .write()
            .expect("discovery target poisoned") = Some(target);
    }

    /// Actual bound address of the discovery socket, once started.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.udp
            .lock()
            .expect("udp slot poisoned")
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Register a handler for an application-defined message type.
    /// Unknown types without a handler are logged and dropped.
    pub fn on_message(&self, msg_type: &str, handler: MessageHandler) {
        self.handlers
            .write()
            .expect("handler table poisoned")
            .insert(msg_type.to_string(), handler);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer table poisoned").len()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn peer(&self, id: &str) -> Option<PeerInfo> {
        self.peers
            .read()
            .expect("peer table poisoned")
            .get(id)
            .map(|e| PeerInfo {
                descriptor: e.descriptor.clone(),
                state: e.state,
                last_seen: e.last_seen_at,
            })
    }

    pub fn peers_snapshot(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .peers
            .read()
            .expect("peer table poisoned")
            .values()
            .map(|e| PeerInfo {
                descriptor: e.descriptor.clone(),
                state: e.state,
                last_seen: e.last_seen_at,
            })
            .collect();
        out.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        out
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    async fn start_network(&self, shutdown: CancellationToken) -> Result<(), PlatformError> {
        let token = shutdown.child_token();
        *self.cancel.lock().expect("cancel slot poisoned") = token.clone();

        let udp = UdpSocket::bind(("0.0.0.0", self.net.discovery_port))
            .await
            .map_err(|e| {
                PlatformError::Internal(format!(
                    "discovery port {} already bound: {e}",
                    self.net.discovery_port
                ))
            })?;
        udp.set_broadcast(true)
            .map_err(|e| PlatformError::Internal(format!("broadcast unavailable: {e}")))?;
        let udp = Arc::new(udp);
        *self.udp.lock().expect("udp slot poisoned") = Some(udp.clone());

        let listener = TcpListener::bind(("0.0.0.0", self.net.channel_port))
            .await
            .map_err(|e| {
                PlatformError::Internal(format!(
                    "channel port {} already bound: {e}",
                    self.net.channel_port
                ))
            })?;
        let channel_port = listener
            .local_addr()
            .map_err(|e| PlatformError::Internal(e.to_string()))?
            .port();
        self.local
            .write()
            .expect("local descriptor poisoned")
            .channel_port = channel_port;

        let (signal_tx, signal_rx) = mpsc::channel(256);
        *self.signals.lock().expect("signal slot poisoned") = Some(signal_tx);

        let manager = self.strong();
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(tokio::spawn(Self::udp_loop(
            manager.clone(),
            udp,
            token.clone(),
        )));
        tasks.push(tokio::spawn(Self::accept_loop(
            manager.clone(),
            listener,
            token.clone(),
        )));
        tasks.push(tokio::spawn(Self::dispatch_loop(
            manager.clone(),
            signal_rx,
            token.clone(),
        )));
        tasks.push(tokio::spawn(Self::keep_alive_loop(
            manager.clone(),
            token.clone(),
        )));
        tasks.push(tokio::spawn(Self::periodic_discovery_loop(
            manager.clone(),
            token,
        )));
        drop(tasks);

        self.install_event_bridge();
        info!(channel_port, "peer manager started");
        Ok(())
    }

    async fn stop_network(&self, deadline: Duration) {
        self.cancel.lock().expect("cancel slot poisoned").cancel();

        if let Some(sub) = self.bridge_sub.lock().expect("bridge slot poisoned").take() {
            self.bus.unsubscribe(sub);
        }

        let channels = std::mem::take(&mut *self.channels.lock().expect("channel table poisoned"));
        for handle in channels.values() {
            handle.close();
        }

        let removed: Vec<PeerDescriptor> = {
            let mut peers = self.peers.write().expect("peer table poisoned");
            peers.drain().map(|(_, e)| e.descriptor).collect()
        };
        for descriptor in removed {
            self.publish_peer_left(&descriptor);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list poisoned"));
        for task in tasks {
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!("peer task did not stop before deadline");
            }
        }
        *self.signals.lock().expect("signal slot poisoned") = None;
        *self.udp.lock().expect("udp slot poisoned") = None;
    }

    /// Forward locally-originated `resource.*` events to connected peers.
    /// Remote events carry an `origin` marker and are not re-forwarded.
    fn install_event_bridge(&self) {
        let weak = self.weak.clone();
        let result = self.bus.subscribe(
            "resource.*",
            Owner::Platform,
            Arc::new(move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(manager) = weak.upgrade() else { return };
                    if event.metadata.contains_key(ORIGIN_KEY) {
                        return;
                    }
                    let local_id = manager.local_descriptor().id;
                    let mut forwarded = (*event).clone();
                    forwarded
                        .metadata
                        .insert(ORIGIN_KEY.to_string(), local_id);
                    if let Ok(payload) = serde_json::to_value(&forwarded) {
                        if let Err(err) = manager.broadcast("event", payload).await {
                            debug!(%err, "event fan-out to peers incomplete");
                        }
                    }
                })
            }),
        );
        match result {
            Ok(sub) => {
                *self.bridge_sub.lock().expect("bridge slot poisoned") = Some(sub);
            }
            Err(err) => warn!(%err, "event bridge not installed"),
        }
    }

    // ── discovery ──────────────────────────────────────────────────────

    fn discovery_destination(&self) -> Result<SocketAddr, PlatformError> {
        if let Some(target) = *self
            .discovery_target
            .read()
            .expect("discovery target poisoned")
        {
            return Ok(target);
        }
        format!("{}:{}", self.net.broadcast_addr, self.net.discovery_port)
            .parse()
            .map_err(|e| PlatformError::Internal(format!("bad broadcast address: {e}")))
    }

    async fn send_discover(&self) -> Result<(), PlatformError> {
        let udp = self
            .udp
            .lock()
            .expect("udp slot poisoned")
            .clone()
            .ok_or_else(|| PlatformError::Unavailable("discovery is not running".to_string()))?;
        let frame = DiscoveryFrame {
            kind: DISCOVER.to_string(),
            peer: self.local_descriptor(),
        };
        let raw = serde_json::to_vec(&frame)?;
        let dest = self.discovery_destination()?;
        udp.send_to(&raw, dest)
            .await
            .map_err(|e| PlatformError::Unavailable(format!("discovery send failed: {e}")))?;
        Ok(())
    }

    /// One bounded discovery pass: broadcast a request, collect responses
    /// for the configured window, and return the merged peer table.
    pub async fn discover_once(&self) -> Result<Vec<PeerInfo>, PlatformError> {
        self.send_discover().await?;
        tokio::time::sleep(self.net.discovery_window).await;
        Ok(self.peers_snapshot())
    }

    async fn udp_loop(manager: Arc<PeerManager>, udp: Arc<UdpSocket>, token: CancellationToken) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = udp.recv_from(&mut buf) => received,
            };
            let (len, src) = match received {
                Ok(pair) => pair,
                Err(err) => {
                    debug!(%err, "discovery socket error");
                    continue;
                }
            };
            let Ok(frame) = serde_json::from_slice::<DiscoveryFrame>(&buf[..len]) else {
                debug!(%src, "malformed discovery datagram dropped");
                continue;
            };
            let local_id = manager.local_descriptor().id;
            if frame.peer.id == local_id {
                continue;
            }
            match frame.kind.as_str() {
                DISCOVER => {
                    manager.record_sighting(frame.peer);
                    let reply = DiscoveryFrame {
                        kind: DISCOVER_RESPONSE.to_string(),
                        peer: manager.local_descriptor(),
                    };
                    if let Ok(raw) = serde_json::to_vec(&reply) {
                        if let Err(err) = udp.send_to(&raw, src).await {
                            debug!(%err, %src, "discovery reply failed");
                        }
                    }
                }
                DISCOVER_RESPONSE => {
                    manager.record_sighting(frame.peer);
                }
                other => debug!(kind = other, "unknown discovery frame dropped"),
            }
        }
    }

    async fn periodic_discovery_loop(manager: Arc<PeerManager>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(manager.net.discovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = manager.send_discover().await {
                        debug!(%err, "periodic discovery pass failed");
                    }
                }
            }
        }
    }

    /// Upsert a peer from a discovery datagram or handshake.
    pub(crate) fn record_sighting(&self, descriptor: PeerDescriptor) {
        if descriptor.id == self.local_descriptor().id {
            return;
        }
        let joined = {
            let mut peers = self.peers.write().expect("peer table poisoned");
            match peers.get_mut(&descriptor.id) {
                Some(entry) => {
                    entry.descriptor = descriptor.clone();
                    entry.touch();
                    if entry.state == PeerState::Stale {
                        entry.state = PeerState::Discovered;
                    }
                    false
                }
                None => {
                    peers.insert(
                        descriptor.id.clone(),
                        PeerEntry {
                            descriptor: descriptor.clone(),
                            state: PeerState::Discovered,
                            last_seen: Instant::now(),
                            last_seen_at: chrono::Utc::now(),
                        },
                    );
                    true
                }
            }
        };
        if joined {
            info!(peer = %descriptor.id, name = %descriptor.name, "peer discovered");
            self.publish_event(
                "peer.joined",
                serde_json::to_value(&descriptor).unwrap_or_default(),
            );
        }
    }

    /// Any received message resets the peer's timers and marks it
    /// connected.
    fn record_message_from(&self, peer_id: &str) {
        let mut peers = self.peers.write().expect("peer table poisoned");
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.touch();
            entry.state = PeerState::Connected;
        }
    }

    // ── channels & messaging ───────────────────────────────────────────

    async fn accept_loop(manager: Arc<PeerManager>, listener: TcpListener, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        if let Err(err) = manager.handle_inbound(stream).await {
                            debug!(%addr, %err, "inbound channel rejected");
                        }
                    });
                }
                Err(err) => debug!(%err, "accept failed"),
            }
        }
    }

    async fn handle_inbound(&self, stream: TcpStream) -> Result<(), PlatformError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        // First frame each way is the plaintext handshake.
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
            .await
            .map_err(|_| PlatformError::Unavailable("handshake timed out".to_string()))?
            .ok_or_else(|| PlatformError::Unavailable("connection closed".to_string()))?
            .map_err(|e| PlatformError::Unavailable(e.to_string()))?;
        let handshake: PeerMessage = serde_json::from_slice(&first)?;
        if handshake.msg_type != "handshake" {
            return Err(PlatformError::InvalidRequest(format!(
                "expected handshake, got {}",
                handshake.msg_type
            )));
        }
        let descriptor: PeerDescriptor = serde_json::from_value(handshake.payload.clone())?;
        let peer_id = descriptor.id.clone();
        self.record_sighting(descriptor);
        self.record_message_from(&peer_id);

        let local = self.local_descriptor();
        let reply = PeerMessage::new(
            "handshake",
            &local.id,
            &peer_id,
            serde_json::to_value(&local)?,
        );
        writer
            .send(Bytes::from(serde_json::to_vec(&reply)?))
            .await
            .map_err(|e| PlatformError::Unavailable(e.to_string()))?;

        self.install_channel(reader, writer, peer_id);
        Ok(())
    }

    async fn open_channel(&self, peer_id: &str) -> Result<ChannelHandle, PlatformError> {
        let descriptor = self
            .peers
            .read()
            .expect("peer table poisoned")
            .get(peer_id)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| {
                PlatformError::Unavailable(format!("peer {peer_id} unreachable: unknown peer"))
            })?;
        let addr = format!("{}:{}", descriptor.address, descriptor.channel_port);
        let stream = tokio::time::timeout(self.net.write_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                PlatformError::Unavailable(format!("peer {peer_id} unreachable: connect timeout"))
            })?
            .map_err(|e| {
                PlatformError::Unavailable(format!("peer {peer_id} unreachable: {e}"))
            })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let local = self.local_descriptor();
        let handshake = PeerMessage::new(
            "handshake",
            &local.id,
            peer_id,
            serde_json::to_value(&local)?,
        );
        writer
            .send(Bytes::from(serde_json::to_vec(&handshake)?))
            .await
            .map_err(|e| PlatformError::Unavailable(format!("peer {peer_id} unreachable: {e}")))?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
            .await
            .map_err(|_| PlatformError::Unavailable(format!("peer {peer_id} handshake timed out")))?
            .ok_or_else(|| PlatformError::Unavailable(format!("peer {peer_id} closed connection")))?
            .map_err(|e| PlatformError::Unavailable(e.to_string()))?;
        let reply: PeerMessage = serde_json::from_slice(&reply)?;
        if reply.msg_type == "handshake" {
            if let Ok(descriptor) = serde_json::from_value::<PeerDescriptor>(reply.payload.clone()) {
                self.record_sighting(descriptor);
            }
        }
        self.record_message_from(peer_id);

        Ok(self.install_channel(reader, writer, peer_id.to_string()))
    }

    /// Register a freshly-handshaken channel, atomically replacing any
    /// previous one for the same peer.
    fn install_channel(
        &self,
        reader: crate::channel::ChannelReader,
        writer: crate::channel::ChannelWriter,
        peer_id: String,
    ) -> ChannelHandle {
        let signals = self
            .signals
            .lock()
            .expect("signal slot poisoned")
            .clone()
            .expect("signals installed while running");
        let local_id = self.local_descriptor().id;
        let (handle, tasks) = spawn_channel(
            reader,
            writer,
            local_id,
            peer_id.clone(),
            self.crypto.clone(),
            self.net.write_timeout,
            signals,
        );
        if let Some(previous) = self
            .channels
            .lock()
            .expect("channel table poisoned")
            .insert(peer_id, handle.clone())
        {
            previous.close();
        }
        self.tasks.lock().expect("task list poisoned").extend(tasks);
        handle
    }

    async fn ensure_channel(&self, peer_id: &str) -> Result<ChannelHandle, PlatformError> {
        if let Some(handle) = self
            .channels
            .lock()
            .expect("channel table poisoned")
            .get(peer_id)
        {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        self.open_channel(peer_id).await
    }

    /// Send a message to one peer, opening a channel on first use.
    /// Messages to a single peer leave in submission order.
    pub async fn send(
        &self,
        peer_id: &str,
        msg_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), PlatformError> {
        let handle = self.ensure_channel(peer_id).await?;
        let local = self.local_descriptor();
        let msg = PeerMessage::new(msg_type, &local.id, peer_id, payload);
        handle.send(msg, self.net.write_timeout).await?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fan a message out to every known peer concurrently. Individual
    /// failures are logged; the call errs only when more than half of the
    /// sends failed.
    pub async fn broadcast(
        &self,
        msg_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), PlatformError> {
        let ids: Vec<String> = self
            .peers
            .read()
            .expect("peer table poisoned")
            .keys()
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let total = ids.len();
        let sends = ids.into_iter().map(|id| {
            let payload = payload.clone();
            async move {
                let result = self.send(&id, msg_type, payload).await;
                if let Err(err) = &result {
                    warn!(peer = %id, %err, "broadcast send failed");
                }
                result.is_err()
            }
        });
        let failed = futures_util::future::join_all(sends)
            .await
            .into_iter()
            .filter(|failed| *failed)
            .count();
        if failed * 2 > total {
            return Err(PlatformError::Unavailable(format!(
                "broadcast failed for {failed} of {total} peers"
            )));
        }
        Ok(())
    }

    // ── inbound dispatch ───────────────────────────────────────────────

    async fn dispatch_loop(
        manager: Arc<PeerManager>,
        mut signals: mpsc::Receiver<ChannelSignal>,
        token: CancellationToken,
    ) {
        loop {
            let signal = tokio::select! {
                _ = token.cancelled() => break,
                signal = signals.recv() => signal,
            };
            let Some(signal) = signal else { break };
            match signal {
                ChannelSignal::Inbound(peer_id, msg) => {
                    manager.messages_received.fetch_add(1, Ordering::Relaxed);
                    manager.record_message_from(&peer_id);
                    manager.handle_message(peer_id, msg).await;
                }
                ChannelSignal::Closed {
                    peer_id,
                    crypto_failure,
                } => {
                    let removed = {
                        let mut channels =
                            manager.channels.lock().expect("channel table poisoned");
                        match channels.get(&peer_id) {
                            Some(handle) if handle.is_closed() => {
                                channels.remove(&peer_id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if removed && crypto_failure {
                        manager.publish_event(
                            "peer.channel_failure",
                            serde_json::json!({ "peer": peer_id }),
                        );
                    }
                }
            }
        }
    }

    async fn handle_message(&self, peer_id: String, msg: PeerMessage) {
        let msg_type = msg.msg_type.clone();
        match msg_type.as_str() {
            "handshake" => {
                if let Ok(descriptor) =
                    serde_json::from_value::<PeerDescriptor>(msg.payload.clone())
                {
                    self.record_sighting(descriptor);
                    self.record_message_from(&peer_id);
                }
            }
            "ping" => {
                let manager = self.strong();
                tokio::spawn(async move {
                    let _ = manager.send(&peer_id, "pong", serde_json::Value::Null).await;
                });
            }
            "pong" => {}
            "event" => self.handle_remote_event(&peer_id, msg),
            other => {
                let handler = self
                    .handlers
                    .read()
                    .expect("handler table poisoned")
                    .get(other)
                    .cloned();
                match handler {
                    Some(handler) => handler(msg).await,
                    None => {
                        warn!(peer = %peer_id, msg_type = other, "unknown message type dropped");
                    }
                }
            }
        }
    }

    /// Republish a remote event locally, attributed to the sending peer.
    /// The `origin` marker stops it from bouncing back out.
    fn handle_remote_event(&self, peer_id: &str, msg: PeerMessage) {
        let Ok(mut event) = serde_json::from_value::<PlatformEvent>(msg.payload) else {
            warn!(peer = %peer_id, "malformed remote event dropped");
            return;
        };
        let local_id = self.local_descriptor().id;
        if event.metadata.get(ORIGIN_KEY) == Some(&local_id) {
            return;
        }
        event.source = peer_id.to_string();
        event
            .metadata
            .entry(ORIGIN_KEY.to_string())
            .or_insert_with(|| peer_id.to_string());
        if let Err(err) = self.bus.publish(event) {
            debug!(%err, "remote event not republished");
        }
    }

    // ── keep-alive ─────────────────────────────────────────────────────

    async fn keep_alive_loop(manager: Arc<PeerManager>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(manager.net.keep_alive);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => manager.tick_keep_alive().await,
            }
        }
    }

    /// One keep-alive pass: ping connected peers, mark quiet ones stale,
    /// and remove peers whose grace ran out, emitting `peer.left` once.
    pub async fn tick_keep_alive(&self) {
        let stale_after = self.net.keep_alive * 3;
        let remove_after = stale_after + self.net.grace;
        let mut removed = Vec::new();
        let mut to_ping = Vec::new();
        {
            let mut peers = self.peers.write().expect("peer table poisoned");
            peers.retain(|id, entry| {
                let elapsed = entry.last_seen.elapsed();
                if elapsed > remove_after {
                    removed.push(entry.descriptor.clone());
                    return false;
                }
                if elapsed > stale_after {
                    entry.state = PeerState::Stale;
                } else if entry.state == PeerState::Connected {
                    to_ping.push(id.clone());
                }
                true
            });
        }
        for descriptor in removed {
            if let Some(handle) = self
                .channels
                .lock()
                .expect("channel table poisoned")
                .remove(&descriptor.id)
            {
                handle.close();
            }
            info!(peer = %descriptor.id, "peer removed after missed keep-alives");
            self.publish_peer_left(&descriptor);
        }
        for id in to_ping {
            let manager = self.strong();
            tokio::spawn(async move {
                let _ = manager.send(&id, "ping", serde_json::Value::Null).await;
            });
        }
    }

    fn publish_peer_left(&self, descriptor: &PeerDescriptor) {
        self.publish_event(
            "peer.left",
            serde_json::to_value(descriptor).unwrap_or_default(),
        );
    }

    fn publish_event(&self, event_type: &str, payload: serde_json::Value) {
        let event = PlatformEvent::new(event_type, "platform", payload)
            .with_metadata(ORIGIN_KEY, self.local_descriptor().id);
        if let Err(err) = self.bus.publish(event) {
            debug!(%err, event_type, "peer event not published");
        }
    }
}

impl Service for PeerManager {
    fn name(&self) -> &str {
        "peers"
    }

    fn depends_on(&self) -> Vec<String> {
        vec!["event-bus".to_string()]
    }

    fn start(&self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(self.start_network(shutdown))
    }

    fn stop(&self, deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.stop_network(deadline).await;
            Ok(())
        })
    }

    fn health(&self) -> BoxFuture<'_, HealthState> {
        Box::pin(async { HealthState::Healthy })
    }
}
