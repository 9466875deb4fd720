use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What one instance advertises about itself: the Peer entity minus
/// `lastSeen`. This is exactly what travels in discovery datagrams and
/// handshake frames.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerDescriptor {
    /// Stable opaque id, generated once per process.
    pub id: String,
    pub name: String,
    pub address: String,
    /// HTTP front-door port.
    pub port: u16,
    /// TCP port for message channels.
    #[serde(default)]
    pub channel_port: u16,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl PeerDescriptor {
    /// Build the local descriptor: hostname as the display name and the
    /// first non-loopback interface address.
    pub fn local(http_port: u16, channel_port: u16, capabilities: Vec<String>) -> Self {
        let name = gethostname::gethostname().to_string_lossy().into_owned();
        let address = local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            address,
            port: http_port,
            channel_port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities,
            metadata: HashMap::new(),
        }
    }
}

/// Liveness state of a known peer. `Unknown` is the absence of a table
/// entry and `Removed` is its deletion, so neither is represented here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Discovered,
    Connected,
    Stale,
}

pub(crate) struct PeerEntry {
    pub descriptor: PeerDescriptor,
    pub state: PeerState,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
}

impl PeerEntry {
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }
}

/// Immutable snapshot handed to readers; the table itself never escapes
/// the manager.
#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    #[serde(flatten)]
    pub descriptor: PeerDescriptor,
    pub state: PeerState,
    pub last_seen: DateTime<Utc>,
}

/// One frame on a peer channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub from: String,
    pub to: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl PeerMessage {
    pub fn new(
        msg_type: &str,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Discovery datagram: `{"type": "discover", "peer": {...}}` or the
/// matching `discover_response`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DiscoveryFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub peer: PeerDescriptor,
}

pub(crate) const DISCOVER: &str = "discover";
pub(crate) const DISCOVER_RESPONSE: &str = "discover_response";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_wire_format_uses_type_tag() {
        let descriptor = PeerDescriptor {
            id: "p1".to_string(),
            name: "laptop".to_string(),
            address: "192.168.1.2".to_string(),
            port: 8000,
            channel_port: 8990,
            version: "0.1.0".to_string(),
            capabilities: vec!["clipboard".to_string()],
            metadata: HashMap::new(),
        };
        let frame = DiscoveryFrame {
            kind: DISCOVER.to_string(),
            peer: descriptor,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "discover");
        assert_eq!(json["peer"]["id"], "p1");
        assert_eq!(json["peer"]["capabilities"][0], "clipboard");
    }

    #[test]
    fn message_roundtrip() {
        let msg = PeerMessage::new("event", "a", "b", serde_json::json!({"k": 1}));
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: PeerMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.msg_type, "event");
        assert_eq!(back.from, "a");
        assert_eq!(back.payload["k"], 1);
    }

    #[test]
    fn local_descriptor_has_identity() {
        let local = PeerDescriptor::local(8000, 8990, vec!["files".to_string()]);
        assert!(!local.id.is_empty());
        assert!(!local.address.is_empty());
        assert_eq!(local.port, 8000);
    }
}
