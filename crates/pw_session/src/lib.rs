//! pw_session — the Peerwire session layer
//!
//! Owns the connection lifecycle between exactly two peers: outbound
//! connect, inbound approval, the open encrypted session, and every way a
//! session can end (reject, cancel, disconnect, peer vanishing). The
//! cryptography lives in `pw_crypto`, the wire format in `pw_proto`; this
//! crate decides WHEN each of those is allowed to happen.
//!
//! # Module layout
//! - `machine`  — the synchronous state machine (all invariants live here)
//! - `driver`   — per-session task: ordered input queue, channel I/O,
//!   prompt dispatch
//! - `channel`  — the transport seam (`ChannelAdapter` & friends)
//! - `memory`   — in-process adapter for tests and demos
//! - `endpoint` — identity ownership and the one-session-at-a-time rule
//! - `prompt`   — human-decision hooks
//! - `config`   — tuning knobs
//! - `error`    — session error taxonomy

pub mod channel;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod machine;
pub mod memory;
pub mod prompt;

pub use channel::{ChannelAdapter, ChannelError, ChannelEvent, ChannelPair, IncomingChannel};
pub use config::SessionConfig;
pub use driver::{spawn_inbound, spawn_outbound, SessionEvents, SessionHandle};
pub use endpoint::Endpoint;
pub use error::SessionError;
pub use machine::{MessageContent, MessageRecord, SessionEvent, SessionState};
pub use prompt::{AutoApprove, UserPrompt};
