//! Peer management: LAN discovery, liveness, and message channels.
//!
//! Discovery speaks JSON datagrams on UDP: a broadcast `discover` request
//! answered by unicast `discover_response`, each carrying the sender's
//! peer descriptor. Messaging runs over per-peer TCP channels carrying
//! length-prefixed JSON frames, optionally sealed by the platform's
//! channel crypto.
//!
//! Per peer, the state machine is
//!
//! ```text
//! Unknown -> Discovered -> Connected -> Stale -> Removed
//! ```
//!
//! where any received message resets a peer to Connected, and a peer
//! quiet for three keep-alive intervals plus the grace period is removed
//! with a single `peer.left` event.

mod channel;
mod manager;
mod peer;

pub use manager::{MessageHandler, PeerManager, PeerNetConfig};
pub use peer::{PeerDescriptor, PeerInfo, PeerMessage, PeerState};
