//! Human-decision hooks.
//!
//! These are the only core operations allowed to suspend on a person
//! (bounded, if at all, by `SessionConfig::approval_timeout`).

use async_trait::async_trait;

use pw_crypto::PeerId;

#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// An inbound connection from `remote` wants a session. `true` accepts.
    async fn approve_connection(&self, remote: &PeerId) -> bool;

    /// The peer vanished from an open session ("peer left, leave too?").
    /// `true` tears the session down; `false` keeps the message history
    /// readable until an explicit exit.
    async fn confirm_leave(&self, remote: &PeerId) -> bool;
}

/// Approves everything. For demos and tests.
pub struct AutoApprove;

#[async_trait]
impl UserPrompt for AutoApprove {
    async fn approve_connection(&self, _remote: &PeerId) -> bool {
        true
    }

    async fn confirm_leave(&self, _remote: &PeerId) -> bool {
        true
    }
}
