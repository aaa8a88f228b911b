//! In-process channel adapter.
//!
//! Pairs of byte queues standing in for a real transport, addressed by
//! `PeerId` through a shared hub. No privileges, no sockets; the session
//! layer cannot tell the difference. Used by the integration tests and the
//! demo app.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use pw_crypto::PeerId;

use crate::channel::{
    ChannelAdapter, ChannelError, ChannelEvent, ChannelPair, ChannelSender, IncomingChannel,
};

/// Depth of each per-channel event queue.
const CHANNEL_DEPTH: usize = 256;

/// Registry connecting every in-process peer to every other.
#[derive(Clone, Default)]
pub struct MemoryHub {
    listeners: Arc<Mutex<HashMap<PeerId, mpsc::Sender<IncomingChannel>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `local` with the hub. Returns the adapter for outbound
    /// channels and the stream of inbound ones. Re-registering an id
    /// replaces its previous listener (identity recalculation).
    pub fn register(&self, local: PeerId) -> (MemoryAdapter, mpsc::Receiver<IncomingChannel>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_DEPTH);
        self.listeners
            .lock()
            .expect("hub lock poisoned")
            .insert(local.clone(), incoming_tx);
        (
            MemoryAdapter {
                local,
                hub: self.clone(),
            },
            incoming_rx,
        )
    }
}

/// Outbound side of a registered peer.
pub struct MemoryAdapter {
    local: PeerId,
    hub: MemoryHub,
}

#[async_trait]
impl ChannelAdapter for MemoryAdapter {
    async fn open(&self, remote: &PeerId) -> Result<ChannelPair, ChannelError> {
        let listener = self
            .hub
            .listeners
            .lock()
            .expect("hub lock poisoned")
            .get(remote)
            .cloned()
            .ok_or_else(|| ChannelError::Unreachable(remote.clone()))?;

        // Two linked duplex halves; each side's sends surface as Data events
        // on the other's stream.
        let (to_caller_tx, to_caller_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (to_remote_tx, to_remote_rx) = mpsc::channel(CHANNEL_DEPTH);

        // Both ends observe the channel coming up before any data.
        to_caller_tx
            .send(ChannelEvent::Open)
            .await
            .map_err(|_| ChannelError::Closed)?;
        to_remote_tx
            .send(ChannelEvent::Open)
            .await
            .map_err(|_| ChannelError::Closed)?;

        let caller_pair = ChannelPair {
            sender: Box::new(MemorySender {
                peer_events: to_remote_tx,
            }),
            events: to_caller_rx,
        };
        let remote_pair = ChannelPair {
            sender: Box::new(MemorySender {
                peer_events: to_caller_tx,
            }),
            events: to_remote_rx,
        };

        listener
            .send(IncomingChannel {
                remote: self.local.clone(),
                pair: remote_pair,
            })
            .await
            .map_err(|_| ChannelError::Unreachable(remote.clone()))?;

        Ok(caller_pair)
    }
}

/// Send half: pushes events into the peer's stream.
struct MemorySender {
    peer_events: mpsc::Sender<ChannelEvent>,
}

#[async_trait]
impl ChannelSender for MemorySender {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.peer_events
            .send(ChannelEvent::Data(bytes.to_vec()))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&mut self) {
        // Best effort; the peer may already be gone.
        let _ = self.peer_events.send(ChannelEvent::Closed).await;
    }
}
