//! One party's long-lived anchor: its identity plus the single live session.
//!
//! The endpoint enforces the things that outlive any one session: exactly
//! one session at a time, inbound channels closed while busy, and identity
//! recalculation tearing down whatever was in progress. Transports that
//! route by `PeerId` must be re-registered by the caller after a
//! recalculation — the address IS the public key.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use pw_crypto::{Identity, PeerId};

use crate::{
    channel::{ChannelAdapter, IncomingChannel},
    config::SessionConfig,
    driver::{spawn_inbound, spawn_outbound, SessionEvents, SessionHandle},
    error::SessionError,
    machine::SessionState,
    prompt::UserPrompt,
};

pub struct Endpoint {
    adapter: Arc<dyn ChannelAdapter>,
    prompt: Arc<dyn UserPrompt>,
    config: SessionConfig,
    identity: Mutex<Arc<Identity>>,
    current: Mutex<Option<SessionHandle>>,
}

impl Endpoint {
    pub fn new(
        identity: Arc<Identity>,
        adapter: Arc<dyn ChannelAdapter>,
        prompt: Arc<dyn UserPrompt>,
        config: SessionConfig,
    ) -> Self {
        Self {
            adapter,
            prompt,
            config,
            identity: Mutex::new(identity),
            current: Mutex::new(None),
        }
    }

    pub async fn peer_id(&self) -> PeerId {
        self.identity.lock().await.peer_id().clone()
    }

    pub async fn fingerprint(&self) -> String {
        self.identity.lock().await.peer_id().fingerprint()
    }

    /// Replace the identity with a freshly generated keypair. Any live
    /// session bound to the old identity is torn down first.
    pub async fn recalculate_identity(&self) -> PeerId {
        if let Some(handle) = self.current.lock().await.take() {
            end_session(&handle).await;
        }

        let fresh = Arc::new(Identity::generate());
        let peer_id = fresh.peer_id().clone();
        *self.identity.lock().await = fresh;
        info!(peer = %peer_id, "identity recalculated");
        peer_id
    }

    /// Start an outbound session and wait for the peer's decision.
    ///
    /// Errs with `InvalidState` while another session is live. On success
    /// the session is `Open`; on `Rejected`/`Cancelled`/channel errors the
    /// slot is free again for the next attempt.
    pub async fn connect(
        &self,
        remote: PeerId,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        let identity = self.identity.lock().await.clone();
        let (handle, events) = {
            let mut current = self.current.lock().await;
            if let Some(state) = live_state(current.as_ref()).await {
                return Err(SessionError::InvalidState { state });
            }
            let (handle, events) = spawn_outbound(
                identity,
                self.adapter.clone(),
                self.prompt.clone(),
                self.config.clone(),
            );
            *current = Some(handle.clone());
            (handle, events)
        };

        // The lock is released while the handshake (a human decision on the
        // other side) runs.
        handle.initiate(remote).await?;
        Ok((handle, events))
    }

    /// Hand an inbound channel to a new session, unless one is already live
    /// — a second caller is refused by closing its channel.
    pub async fn accept_incoming(
        &self,
        mut incoming: IncomingChannel,
    ) -> Option<(SessionHandle, SessionEvents)> {
        let identity = self.identity.lock().await.clone();
        let mut current = self.current.lock().await;
        if let Some(state) = live_state(current.as_ref()).await {
            warn!(
                remote = %incoming.remote,
                ?state,
                "refusing inbound channel while a session is live"
            );
            incoming.pair.sender.close().await;
            return None;
        }

        let (handle, events) = spawn_inbound(
            identity,
            incoming,
            self.prompt.clone(),
            self.config.clone(),
        );
        *current = Some(handle.clone());
        Some((handle, events))
    }

    /// Cancel whatever handshake the current session has in flight. The
    /// peer gets its `connection-cancelled`; dropping an `initiate` future
    /// instead would leave it waiting.
    pub async fn cancel_current(&self) {
        let current = self.current.lock().await;
        if let Some(handle) = current.as_ref() {
            let _ = handle.cancel().await;
        }
    }

    /// The current session's state, if any survives.
    pub async fn session_state(&self) -> Option<SessionState> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(handle) => handle.state().await.ok(),
            None => None,
        }
    }
}

/// `Some(state)` when the handle still names a session that is neither
/// finished nor gone.
async fn live_state(handle: Option<&SessionHandle>) -> Option<SessionState> {
    let handle = handle?;
    match handle.state().await {
        Ok(
            state @ (SessionState::Connecting
            | SessionState::AwaitingApproval
            | SessionState::AwaitingLocalDecision
            | SessionState::Open
            | SessionState::PeerLeft),
        ) => Some(state),
        _ => None,
    }
}

/// Best-effort teardown for whatever phase the session is in.
async fn end_session(handle: &SessionHandle) {
    match handle.state().await {
        Ok(SessionState::Open) => {
            let _ = handle.disconnect().await;
        }
        Ok(SessionState::PeerLeft) => {
            let _ = handle.exit().await;
        }
        Ok(
            SessionState::Connecting
            | SessionState::AwaitingApproval
            | SessionState::AwaitingLocalDecision,
        ) => {
            let _ = handle.cancel().await;
        }
        _ => {}
    }
}
