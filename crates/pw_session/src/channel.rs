//! The channel seam — where a real transport (WebRTC data channel, TCP
//! socket, Tor stream) plugs into the session layer.
//!
//! The core assumes nothing beyond a reliable-ish point-to-point byte
//! channel addressed by `PeerId`: a send half plus an ordered stream of
//! events. Transports deliver events in arrival order; the session driver
//! preserves that order all the way into the state machine.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use pw_crypto::PeerId;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("No route to peer {0}")]
    Unreachable(PeerId),

    #[error("Channel I/O failure: {0}")]
    Io(String),
}

/// What a transport reports about one channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel finished connecting and can carry data.
    Open,
    /// One inbound message (a serialised envelope).
    Data(Vec<u8>),
    /// The remote side went away.
    Closed,
    /// Transport-level failure.
    Error(String),
}

/// Send half of one channel.
#[async_trait]
pub trait ChannelSender: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;
    async fn close(&mut self);
}

/// A connected channel: its send half and its event stream. Dropping the
/// event receiver is equivalent to closing.
pub struct ChannelPair {
    pub sender: Box<dyn ChannelSender>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// An inbound channel surfaced by a transport's listener side.
pub struct IncomingChannel {
    pub remote: PeerId,
    pub pair: ChannelPair,
}

/// Transport factory for outbound channels.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn open(&self, remote: &PeerId) -> Result<ChannelPair, ChannelError>;
}
