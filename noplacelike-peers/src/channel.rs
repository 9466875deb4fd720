//! Message channels between peers.
//!
//! A channel is one TCP connection carrying length-prefixed frames, each
//! frame a JSON-encoded [`PeerMessage`]. The handshake frame travels in
//! the clear in both directions before the channel tasks take over; every
//! later frame is sealed when channel crypto is enabled.
//!
//! A dedicated writer task serialises writes, so messages to a single
//! peer leave in submission order. The reader task forwards inbound
//! frames to the manager's dispatch loop and reports the close reason.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use noplacelike_core::PlatformError;
use noplacelike_security::ChannelCrypto;

use crate::peer::PeerMessage;

pub(crate) type ChannelReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub(crate) type ChannelWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Signals from channel tasks to the manager's dispatch loop.
pub(crate) enum ChannelSignal {
    Inbound(String, PeerMessage),
    Closed {
        peer_id: String,
        crypto_failure: bool,
    },
}

/// Cheap clonable handle to a live channel.
#[derive(Clone)]
pub(crate) struct ChannelHandle {
    pub peer_id: String,
    tx: mpsc::Sender<PeerMessage>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    /// Queue a message for the writer task. Bounded by the write timeout
    /// so a wedged channel cannot block the caller indefinitely.
    pub async fn send(&self, msg: PeerMessage, timeout: Duration) -> Result<(), PlatformError> {
        self.tx.send_timeout(msg, timeout).await.map_err(|_| {
            PlatformError::Unavailable(format!("peer {} unreachable", self.peer_id))
        })
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Spawn the reader and writer tasks over an already-handshaken stream.
pub(crate) fn spawn_channel(
    mut reader: ChannelReader,
    mut writer: ChannelWriter,
    local_id: String,
    peer_id: String,
    crypto: Option<Arc<ChannelCrypto>>,
    write_timeout: Duration,
    signals: mpsc::Sender<ChannelSignal>,
) -> (ChannelHandle, Vec<tokio::task::JoinHandle<()>>) {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<PeerMessage>(64);

    let read_task = {
        let cancel = cancel.clone();
        let signals = signals.clone();
        let crypto = crypto.clone();
        let local_id = local_id.clone();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = reader.next() => frame,
                };
                match frame {
                    Some(Ok(bytes)) => {
                        let data = match &crypto {
                            Some(crypto) => match crypto.open(&local_id, &peer_id, &bytes) {
                                Ok(data) => data,
                                Err(err) => {
                                    warn!(peer = %peer_id, %err, "channel decrypt failed, closing");
                                    cancel.cancel();
                                    let _ = signals
                                        .send(ChannelSignal::Closed {
                                            peer_id: peer_id.clone(),
                                            crypto_failure: true,
                                        })
                                        .await;
                                    return;
                                }
                            },
                            None => bytes.to_vec(),
                        };
                        match serde_json::from_slice::<PeerMessage>(&data) {
                            Ok(msg) => {
                                let _ = signals
                                    .send(ChannelSignal::Inbound(peer_id.clone(), msg))
                                    .await;
                            }
                            Err(err) => {
                                warn!(peer = %peer_id, %err, "malformed frame dropped");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!(peer = %peer_id, %err, "channel read error");
                        break;
                    }
                    None => break,
                }
            }
            cancel.cancel();
            let _ = signals
                .send(ChannelSignal::Closed {
                    peer_id,
                    crypto_failure: false,
                })
                .await;
        })
    };

    let write_task = {
        let cancel = cancel.clone();
        let local_id = local_id.clone();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => msg,
                };
                let Some(msg) = msg else { break };
                let raw = match serde_json::to_vec(&msg) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(peer = %peer_id, %err, "unserialisable message dropped");
                        continue;
                    }
                };
                let data = match &crypto {
                    Some(crypto) => match crypto.seal(&local_id, &peer_id, &raw) {
                        Ok(data) => data,
                        Err(err) => {
                            warn!(peer = %peer_id, %err, "channel seal failed, closing");
                            break;
                        }
                    },
                    None => raw,
                };
                match tokio::time::timeout(write_timeout, writer.send(Bytes::from(data))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(peer = %peer_id, %err, "channel write error");
                        break;
                    }
                    Err(_) => {
                        warn!(peer = %peer_id, "channel write timed out");
                        break;
                    }
                }
            }
            cancel.cancel();
        })
    };

    (
        ChannelHandle {
            peer_id,
            tx,
            cancel,
        },
        vec![read_task, write_task],
    )
}
