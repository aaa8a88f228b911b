//! The session state machine.
//!
//! This is the synchronous core of the protocol: every command from the
//! caller and every event from the channel becomes one [`Input`], and each
//! input produces the [`Action`]s the driver must carry out. No I/O happens
//! here, which keeps every race representable as a plain sequence of inputs.
//!
//! Lifecycle:
//!
//! ```text
//! Idle → Connecting → AwaitingApproval ─────────────┐ (outbound)
//! Idle → AwaitingLocalDecision ─────────────────────┤ (inbound)
//!                                                   ▼
//!                                                  Open → PeerLeft → Disconnected
//!                                                   │
//!                 Rejected / Cancelled  ◄───────────┘ (from any pre-Open state too)
//! ```
//!
//! Race rules, enforced here:
//! - A `connection-cancelled` observed before the local accept always wins;
//!   the accept is suppressed.
//! - A received `connection-cancelled` is authoritative even when the local
//!   side already sent `connection-accepted` and reached `Open`.
//! - Duplicate or late control envelopes while `Open` are ignored.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use pw_crypto::{derive_shared_secret, Identity, PeerId, SharedSecret};
use pw_proto::{codec, Envelope, FilePayload};

use crate::{config::SessionConfig, error::SessionError};

// ── States ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; `initiate` or an inbound connection is legal.
    Idle,
    /// Outbound channel is being established.
    Connecting,
    /// Outbound channel is up; waiting for the peer's accept/reject.
    AwaitingApproval,
    /// Inbound channel is up; waiting for the local human decision.
    AwaitingLocalDecision,
    /// Handshake complete; encrypted payloads flow.
    Open,
    /// The peer vanished; history stays readable until confirm or exit.
    PeerLeft,
    /// Session finished by a disconnect; a new one may be initiated.
    Disconnected,
    /// Peer declined the connection.
    Rejected,
    /// Handshake cancelled (either side) before reaching `Open`.
    Cancelled,
}

impl SessionState {
    /// States from which a fresh `initiate` is legal: `Idle` plus every
    /// finished session.
    fn connectable(self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::Disconnected
                | SessionState::Rejected
                | SessionState::Cancelled
        )
    }
}

// ── Inputs and outputs ───────────────────────────────────────────────────────

/// Everything that can happen to a session, in the order it happened.
#[derive(Debug)]
pub enum Input {
    // Caller commands
    Initiate { remote: PeerId },
    Cancel,
    Disconnect { initiated_by_user: bool },
    Exit,
    SendText { body: String },
    SendFile {
        bytes: Vec<u8>,
        content_type: String,
        encrypt: bool,
    },
    // Human-decision resolutions
    Approved(bool),
    ApprovalTimedOut,
    LeaveConfirmed(bool),
    // Channel events
    ChannelOpened,
    ChannelData(Vec<u8>),
    ChannelClosed,
    ChannelFailed(String),
}

/// Side effects the driver executes after a transition.
#[derive(Debug)]
pub enum Action {
    OpenChannel { remote: PeerId },
    Send(Envelope),
    /// Best-effort send: a failure is logged, never escalated. Used for the
    /// farewell envelopes of a teardown already in progress.
    SendBestEffort(Envelope),
    CloseChannel,
    AskApproval { remote: PeerId },
    AskLeaveConfirm { remote: PeerId },
    ResolveInitiate(Result<(), SessionError>),
    Notify(SessionEvent),
}

/// Notifications surfaced to the caller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    MessageReceived(MessageRecord),
    PeerLeft(PeerId),
}

// ── Message log ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    File { data: Vec<u8>, content_type: String },
}

/// One entry of the session-scoped history. Cleared when the session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub sender: PeerId,
    pub content: MessageContent,
    pub encrypted: bool,
    pub received_at: DateTime<Utc>,
}

const RAW_FILE_CONTENT_TYPE: &str = "application/octet-stream";

// ── The machine ──────────────────────────────────────────────────────────────

pub struct SessionMachine {
    session_id: Uuid,
    identity: Arc<Identity>,
    config: SessionConfig,

    state: SessionState,
    remote: Option<PeerId>,
    secret: Option<SharedSecret>,
    log: Vec<MessageRecord>,
    channel_open: bool,

    // Race flags, scoped to this session's lifetime.
    remote_cancelled: bool,
    local_cancelled: bool,
    local_rejected: bool,
    local_initiated_disconnect: bool,
}

impl SessionMachine {
    /// A fresh machine with no session (outbound use).
    pub fn new(identity: Arc<Identity>, config: SessionConfig) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            identity,
            config,
            state: SessionState::Idle,
            remote: None,
            secret: None,
            log: Vec::new(),
            channel_open: false,
            remote_cancelled: false,
            local_cancelled: false,
            local_rejected: false,
            local_initiated_disconnect: false,
        }
    }

    /// A machine for an inbound channel that is already connected. Returns
    /// the initial actions (surface the approval request).
    pub fn start_inbound(
        identity: Arc<Identity>,
        remote: PeerId,
        config: SessionConfig,
    ) -> (Self, Vec<Action>) {
        let mut machine = Self::new(identity, config);
        machine.state = SessionState::AwaitingLocalDecision;
        machine.remote = Some(remote.clone());
        machine.channel_open = true;

        let actions = vec![
            Action::AskApproval { remote },
            Action::Notify(SessionEvent::StateChanged(
                SessionState::AwaitingLocalDecision,
            )),
        ];
        (machine, actions)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.remote.as_ref()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Snapshot of the history (empty once the session has ended).
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.log.clone()
    }

    // ── Transition entry point ───────────────────────────────────────────

    pub fn handle(&mut self, input: Input) -> Result<Vec<Action>, SessionError> {
        match input {
            Input::Initiate { remote } => self.on_initiate(remote),
            Input::Cancel => self.on_cancel(),
            Input::Disconnect { initiated_by_user } => self.on_disconnect(initiated_by_user),
            Input::Exit => self.on_exit(),
            Input::SendText { body } => self.on_send_text(body),
            Input::SendFile {
                bytes,
                content_type,
                encrypt,
            } => self.on_send_file(bytes, &content_type, encrypt),
            Input::Approved(accepted) => Ok(self.on_approved(accepted)),
            Input::ApprovalTimedOut => Ok(self.on_approval_timeout()),
            Input::LeaveConfirmed(confirmed) => Ok(self.on_leave_confirmed(confirmed)),
            Input::ChannelOpened => Ok(self.on_channel_opened()),
            Input::ChannelData(bytes) => Ok(self.on_channel_data(&bytes)),
            Input::ChannelClosed => Ok(self.on_channel_closed()),
            Input::ChannelFailed(err) => Ok(self.on_channel_failed(err)),
        }
    }

    // ── Caller commands ──────────────────────────────────────────────────

    fn on_initiate(&mut self, remote: PeerId) -> Result<Vec<Action>, SessionError> {
        if !self.state.connectable() {
            return Err(SessionError::InvalidState { state: self.state });
        }

        // A fresh handshake gets a fresh flag set and log.
        self.session_id = Uuid::new_v4();
        self.secret = None;
        self.log.clear();
        self.remote_cancelled = false;
        self.local_cancelled = false;
        self.local_rejected = false;
        self.local_initiated_disconnect = false;
        self.channel_open = false;
        self.remote = Some(remote.clone());
        self.state = SessionState::Connecting;

        debug!(session = %self.session_id, peer = %remote, "initiating session");
        Ok(vec![
            Action::OpenChannel { remote },
            Action::Notify(SessionEvent::StateChanged(SessionState::Connecting)),
        ])
    }

    fn on_cancel(&mut self) -> Result<Vec<Action>, SessionError> {
        match self.state {
            SessionState::Connecting
            | SessionState::AwaitingApproval
            | SessionState::AwaitingLocalDecision => {
                self.local_cancelled = true;
                let mut actions = Vec::new();
                if self.channel_open {
                    actions.push(Action::SendBestEffort(Envelope::ConnectionCancelled));
                }
                actions.push(Action::ResolveInitiate(Err(SessionError::Cancelled)));
                self.teardown(SessionState::Cancelled, &mut actions);
                Ok(actions)
            }
            // A second cancel after the first is a no-op.
            SessionState::Cancelled => Ok(Vec::new()),
            state => Err(SessionError::InvalidState { state }),
        }
    }

    fn on_disconnect(&mut self, initiated_by_user: bool) -> Result<Vec<Action>, SessionError> {
        match self.state {
            SessionState::Open => {
                self.local_initiated_disconnect = true;
                let mut actions = vec![Action::SendBestEffort(Envelope::disconnect_notify(
                    self.identity.peer_id().clone(),
                ))];
                debug!(
                    session = %self.session_id,
                    initiated_by_user, "disconnecting"
                );
                self.teardown(SessionState::Disconnected, &mut actions);
                Ok(actions)
            }
            // Also ends a lingering post-peer-left session, same as `Exit`.
            SessionState::PeerLeft => self.on_exit(),
            // Idempotent: a repeat call has no additional effect.
            SessionState::Disconnected => Ok(Vec::new()),
            state => Err(SessionError::InvalidState { state }),
        }
    }

    fn on_exit(&mut self) -> Result<Vec<Action>, SessionError> {
        match self.state {
            SessionState::PeerLeft => {
                let mut actions = Vec::new();
                self.teardown(SessionState::Disconnected, &mut actions);
                Ok(actions)
            }
            SessionState::Disconnected => Ok(Vec::new()),
            state => Err(SessionError::InvalidState { state }),
        }
    }

    fn on_send_text(&mut self, body: String) -> Result<Vec<Action>, SessionError> {
        self.require_open()?;
        if body.len() > self.config.max_payload_len {
            return Err(SessionError::PayloadTooLarge(body.len()));
        }
        let Some(secret) = self.secret.as_ref() else {
            return Err(SessionError::NotConnected);
        };

        let sealed = pw_crypto::seal(body.as_bytes(), secret)?;
        let envelope = Envelope::text(&sealed);

        // Log before confirming success to the caller; text sends are
        // fire-and-forget at the protocol level.
        let record = self.append_record(
            self.identity.peer_id().clone(),
            MessageContent::Text(body),
            true,
        );
        Ok(vec![
            Action::Send(envelope),
            Action::Notify(SessionEvent::MessageReceived(record)),
        ])
    }

    fn on_send_file(
        &mut self,
        bytes: Vec<u8>,
        content_type: &str,
        encrypt: bool,
    ) -> Result<Vec<Action>, SessionError> {
        self.require_open()?;
        if bytes.len() > self.config.max_payload_len {
            return Err(SessionError::PayloadTooLarge(bytes.len()));
        }

        let envelope = if encrypt {
            let Some(secret) = self.secret.as_ref() else {
                return Err(SessionError::NotConnected);
            };
            let sealed = pw_crypto::seal(&bytes, secret)?;
            Envelope::encrypted_file(&sealed, content_type)
        } else {
            Envelope::raw_file(&bytes)
        };

        let record = self.append_record(
            self.identity.peer_id().clone(),
            MessageContent::File {
                data: bytes,
                content_type: content_type.to_string(),
            },
            encrypt,
        );
        Ok(vec![
            Action::Send(envelope),
            Action::Notify(SessionEvent::MessageReceived(record)),
        ])
    }

    fn require_open(&self) -> Result<(), SessionError> {
        if self.state != SessionState::Open || !self.channel_open {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    // ── Human decisions ──────────────────────────────────────────────────

    fn on_approved(&mut self, accepted: bool) -> Vec<Action> {
        if self.state != SessionState::AwaitingLocalDecision {
            // Decision resolved after a cancel or timeout already ended the
            // handshake; nothing left to do.
            debug!(session = %self.session_id, state = ?self.state, "late approval decision ignored");
            return Vec::new();
        }

        // Accept must lose to a cancellation observed before this decision.
        if self.remote_cancelled {
            let mut actions = Vec::new();
            self.teardown(SessionState::Cancelled, &mut actions);
            return actions;
        }

        if !accepted {
            self.local_rejected = true;
            let mut actions = vec![Action::Send(Envelope::ConnectionRejected)];
            self.teardown(SessionState::Rejected, &mut actions);
            return actions;
        }

        // Derive before sending the accept: a failed key agreement must not
        // leave the peer believing the session opened.
        match self.establish_secret() {
            Ok(()) => {
                self.state = SessionState::Open;
                vec![
                    Action::Send(Envelope::ConnectionAccepted),
                    Action::Notify(SessionEvent::StateChanged(SessionState::Open)),
                ]
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "key agreement failed on accept");
                let mut actions = vec![Action::SendBestEffort(Envelope::ConnectionCancelled)];
                self.teardown(SessionState::Cancelled, &mut actions);
                actions
            }
        }
    }

    fn on_approval_timeout(&mut self) -> Vec<Action> {
        if self.state != SessionState::AwaitingLocalDecision {
            return Vec::new();
        }
        warn!(session = %self.session_id, "approval timed out; cancelling handshake");
        self.local_cancelled = true;
        let mut actions = vec![Action::SendBestEffort(Envelope::ConnectionCancelled)];
        self.teardown(SessionState::Cancelled, &mut actions);
        actions
    }

    fn on_leave_confirmed(&mut self, confirmed: bool) -> Vec<Action> {
        if self.state != SessionState::PeerLeft {
            return Vec::new();
        }
        if !confirmed {
            // History stays readable; an explicit exit finishes later.
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.teardown(SessionState::Disconnected, &mut actions);
        actions
    }

    // ── Channel events ───────────────────────────────────────────────────

    fn on_channel_opened(&mut self) -> Vec<Action> {
        self.channel_open = true;
        match self.state {
            SessionState::Connecting => {
                // Approval is peer-driven: nothing is sent here.
                self.state = SessionState::AwaitingApproval;
                vec![Action::Notify(SessionEvent::StateChanged(
                    SessionState::AwaitingApproval,
                ))]
            }
            _ => Vec::new(),
        }
    }

    fn on_channel_data(&mut self, bytes: &[u8]) -> Vec<Action> {
        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "dropping malformed envelope");
                return Vec::new();
            }
        };

        match envelope {
            Envelope::ConnectionAccepted => self.on_remote_accepted(),
            Envelope::ConnectionRejected => self.on_remote_rejected(),
            Envelope::ConnectionCancelled => self.on_remote_cancelled(),
            Envelope::DisconnectNotify { peer_id } => self.on_remote_disconnect(&peer_id),
            Envelope::Text {
                nonce,
                encrypted,
                content_type: _,
            } => self.on_payload(&nonce, &encrypted, None),
            Envelope::File { payload } => match payload {
                FilePayload::Encrypted {
                    nonce,
                    encrypted,
                    content_type,
                } => self.on_payload(&nonce, &encrypted, Some(content_type)),
                FilePayload::Raw { data } => self.on_raw_file(&data),
            },
        }
    }

    fn on_remote_accepted(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::AwaitingApproval => match self.establish_secret() {
                Ok(()) => {
                    self.state = SessionState::Open;
                    vec![
                        Action::ResolveInitiate(Ok(())),
                        Action::Notify(SessionEvent::StateChanged(SessionState::Open)),
                    ]
                }
                Err(err) => {
                    warn!(session = %self.session_id, error = %err, "key agreement failed on remote accept");
                    let mut actions = vec![
                        Action::SendBestEffort(Envelope::ConnectionCancelled),
                        Action::ResolveInitiate(Err(err)),
                    ];
                    self.teardown(SessionState::Cancelled, &mut actions);
                    actions
                }
            },
            // Duplicate/late accept for an exchange that is already over.
            _ => {
                debug!(session = %self.session_id, state = ?self.state, "ignoring late connection-accepted");
                Vec::new()
            }
        }
    }

    fn on_remote_rejected(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::AwaitingApproval => {
                let mut actions = vec![Action::ResolveInitiate(Err(SessionError::Rejected))];
                self.teardown(SessionState::Rejected, &mut actions);
                actions
            }
            _ => {
                debug!(session = %self.session_id, state = ?self.state, "ignoring late connection-rejected");
                Vec::new()
            }
        }
    }

    fn on_remote_cancelled(&mut self) -> Vec<Action> {
        self.remote_cancelled = true;
        match self.state {
            SessionState::AwaitingLocalDecision
            | SessionState::AwaitingApproval
            | SessionState::Connecting => {
                let mut actions = vec![Action::ResolveInitiate(Err(SessionError::Cancelled))];
                self.teardown(SessionState::Cancelled, &mut actions);
                actions
            }
            // Cancellation is authoritative even against an in-flight accept
            // that already reached Open on this side.
            SessionState::Open => {
                warn!(session = %self.session_id, "remote cancellation overrides in-flight accept");
                let mut actions = Vec::new();
                self.teardown(SessionState::Cancelled, &mut actions);
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_remote_disconnect(&mut self, peer_id: &PeerId) -> Vec<Action> {
        if self.state != SessionState::Open {
            debug!(session = %self.session_id, state = ?self.state, "ignoring late disconnect-notify");
            return Vec::new();
        }
        if Some(peer_id) != self.remote.as_ref() {
            debug!(session = %self.session_id, "ignoring disconnect-notify for a different peer");
            return Vec::new();
        }
        self.enter_peer_left()
    }

    fn on_channel_closed(&mut self) -> Vec<Action> {
        match self.state {
            // The peer vanished without a farewell.
            SessionState::Open => self.enter_peer_left(),
            SessionState::Connecting
            | SessionState::AwaitingApproval
            | SessionState::AwaitingLocalDecision => {
                let mut actions = vec![Action::ResolveInitiate(Err(SessionError::Channel(
                    "channel closed during handshake".into(),
                )))];
                self.teardown(SessionState::Cancelled, &mut actions);
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_channel_failed(&mut self, err: String) -> Vec<Action> {
        match self.state {
            SessionState::Open => {
                warn!(session = %self.session_id, error = %err, "channel failure on open session");
                let mut actions = Vec::new();
                self.teardown(SessionState::Disconnected, &mut actions);
                actions
            }
            SessionState::Connecting
            | SessionState::AwaitingApproval
            | SessionState::AwaitingLocalDecision => {
                warn!(session = %self.session_id, error = %err, "channel failure during handshake");
                let mut actions =
                    vec![Action::ResolveInitiate(Err(SessionError::Channel(err)))];
                self.teardown(SessionState::Cancelled, &mut actions);
                actions
            }
            _ => Vec::new(),
        }
    }

    // ── Payload reception ────────────────────────────────────────────────

    /// Decrypt and log one inbound payload. `content_type` is `None` for
    /// text. Failures are per-message: logged and dropped, never fatal to
    /// the session.
    fn on_payload(
        &mut self,
        nonce_hex: &str,
        encrypted_hex: &str,
        content_type: Option<String>,
    ) -> Vec<Action> {
        if self.state != SessionState::Open {
            warn!(session = %self.session_id, state = ?self.state, "dropping payload outside open session");
            return Vec::new();
        }
        let Some(secret) = self.secret.as_ref() else {
            return Vec::new();
        };

        let (nonce, ciphertext) =
            match (codec::decode_nonce(nonce_hex), codec::decode_hex(encrypted_hex)) {
                (Ok(nonce), Ok(ciphertext)) => (nonce, ciphertext),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(session = %self.session_id, error = %err, "dropping payload with bad hex fields");
                    return Vec::new();
                }
            };

        let plaintext = match pw_crypto::open(&nonce, &ciphertext, secret) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                // Expected on tampered or wrong-key input; the session
                // continues and the corrupted message never reaches the log.
                warn!(session = %self.session_id, error = %err, "decryption failed; dropping message");
                return Vec::new();
            }
        };

        let content = match content_type {
            None => match String::from_utf8(plaintext) {
                Ok(text) => MessageContent::Text(text),
                Err(_) => {
                    warn!(session = %self.session_id, "dropping text payload with invalid UTF-8");
                    return Vec::new();
                }
            },
            Some(content_type) => MessageContent::File {
                data: plaintext,
                content_type,
            },
        };

        let sender = match self.remote.clone() {
            Some(sender) => sender,
            None => return Vec::new(),
        };
        let record = self.append_record(sender, content, true);
        vec![Action::Notify(SessionEvent::MessageReceived(record))]
    }

    fn on_raw_file(&mut self, data_hex: &str) -> Vec<Action> {
        if self.state != SessionState::Open {
            warn!(session = %self.session_id, state = ?self.state, "dropping payload outside open session");
            return Vec::new();
        }
        let data = match codec::decode_hex(data_hex) {
            Ok(data) => data,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "dropping raw file with bad hex");
                return Vec::new();
            }
        };
        let sender = match self.remote.clone() {
            Some(sender) => sender,
            None => return Vec::new(),
        };
        let record = self.append_record(
            sender,
            MessageContent::File {
                data,
                content_type: RAW_FILE_CONTENT_TYPE.to_string(),
            },
            false,
        );
        vec![Action::Notify(SessionEvent::MessageReceived(record))]
    }

    // ── Shared helpers ───────────────────────────────────────────────────

    fn establish_secret(&mut self) -> Result<(), SessionError> {
        let Some(remote) = self.remote.as_ref() else {
            return Err(SessionError::NotConnected);
        };
        // Computed once per session, cached for every payload after.
        let secret = derive_shared_secret(remote, &self.identity)?;
        self.secret = Some(secret);
        Ok(())
    }

    fn append_record(
        &mut self,
        sender: PeerId,
        content: MessageContent,
        encrypted: bool,
    ) -> MessageRecord {
        let record = MessageRecord {
            sender,
            content,
            encrypted,
            received_at: Utc::now(),
        };
        self.log.push(record.clone());
        record
    }

    /// Full teardown: secret and history are dropped, the channel closes,
    /// and the caller learns the final state.
    fn teardown(&mut self, next: SessionState, actions: &mut Vec<Action>) {
        self.secret = None;
        self.log.clear();
        self.channel_open = false;
        self.state = next;
        actions.push(Action::CloseChannel);
        actions.push(Action::Notify(SessionEvent::StateChanged(next)));
    }

    /// The peer vanished from an open session: keep the history readable,
    /// drop the secret, and ask the human whether to leave too.
    fn enter_peer_left(&mut self) -> Vec<Action> {
        self.secret = None;
        self.channel_open = false;
        self.state = SessionState::PeerLeft;

        let mut actions = vec![Action::CloseChannel];
        if let Some(remote) = self.remote.clone() {
            actions.push(Action::AskLeaveConfirm {
                remote: remote.clone(),
            });
            actions.push(Action::Notify(SessionEvent::PeerLeft(remote)));
        }
        actions.push(Action::Notify(SessionEvent::StateChanged(
            SessionState::PeerLeft,
        )));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identities() -> (Arc<Identity>, Arc<Identity>) {
        (Arc::new(Identity::generate()), Arc::new(Identity::generate()))
    }

    fn wire(envelope: &Envelope) -> Vec<u8> {
        codec::encode(envelope).unwrap()
    }

    fn sends(actions: &[Action]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(e) | Action::SendBestEffort(e) => Some(e.kind()),
                _ => None,
            })
            .collect()
    }

    /// Drive an outbound machine all the way to `Open` against `remote`.
    fn outbound_open(local: &Arc<Identity>, remote: &Arc<Identity>) -> SessionMachine {
        let mut m = SessionMachine::new(local.clone(), SessionConfig::default());
        m.handle(Input::Initiate {
            remote: remote.peer_id().clone(),
        })
        .unwrap();
        m.handle(Input::ChannelOpened).unwrap();
        let actions = m
            .handle(Input::ChannelData(wire(&Envelope::ConnectionAccepted)))
            .unwrap();
        assert_eq!(m.state(), SessionState::Open);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ResolveInitiate(Ok(())))));
        m
    }

    /// Seal `body` the way the remote peer would for `local`.
    fn seal_text_from(remote: &Identity, local: &Identity, body: &str) -> Vec<u8> {
        let secret = derive_shared_secret(local.peer_id(), remote).unwrap();
        let sealed = pw_crypto::seal(body.as_bytes(), &secret).unwrap();
        wire(&Envelope::text(&sealed))
    }

    #[test]
    fn initiate_is_only_legal_when_connectable() {
        let (a, b) = identities();
        let mut m = SessionMachine::new(a, SessionConfig::default());
        m.handle(Input::Initiate {
            remote: b.peer_id().clone(),
        })
        .unwrap();

        let err = m.handle(Input::Initiate {
            remote: b.peer_id().clone(),
        });
        assert!(matches!(
            err,
            Err(SessionError::InvalidState {
                state: SessionState::Connecting
            })
        ));
    }

    #[test]
    fn sends_outside_open_are_not_connected_and_silent() {
        let (a, b) = identities();
        let mut m = SessionMachine::new(a, SessionConfig::default());

        for setup in 0..3 {
            // Idle, Connecting, AwaitingApproval in turn.
            if setup == 1 {
                m.handle(Input::Initiate {
                    remote: b.peer_id().clone(),
                })
                .unwrap();
            }
            if setup == 2 {
                m.handle(Input::ChannelOpened).unwrap();
            }

            let err = m.handle(Input::SendText {
                body: "hi".into(),
            });
            assert!(matches!(err, Err(SessionError::NotConnected)));

            let err = m.handle(Input::SendFile {
                bytes: vec![1],
                content_type: "image/png".into(),
                encrypt: true,
            });
            assert!(matches!(err, Err(SessionError::NotConnected)));
        }
        assert!(m.messages().is_empty());
    }

    #[test]
    fn cancel_wins_over_queued_remote_accept() {
        let (a, b) = identities();
        let mut m = SessionMachine::new(a, SessionConfig::default());
        m.handle(Input::Initiate {
            remote: b.peer_id().clone(),
        })
        .unwrap();
        m.handle(Input::ChannelOpened).unwrap();

        // The remote's accept is in flight, but the local cancel is
        // processed first.
        let actions = m.handle(Input::Cancel).unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);
        assert_eq!(sends(&actions), vec!["connection-cancelled"]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ResolveInitiate(Err(SessionError::Cancelled)))));

        // The late accept must not reopen anything.
        let actions = m
            .handle(Input::ChannelData(wire(&Envelope::ConnectionAccepted)))
            .unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);
        assert!(actions.is_empty());
    }

    #[test]
    fn accept_loses_to_prior_remote_cancel() {
        let (a, b) = identities();
        let (mut m, _) = SessionMachine::start_inbound(
            a,
            b.peer_id().clone(),
            SessionConfig::default(),
        );

        let actions = m
            .handle(Input::ChannelData(wire(&Envelope::ConnectionCancelled)))
            .unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);
        assert!(sends(&actions).is_empty());

        // The human said yes after the cancel: the accept is suppressed.
        let actions = m.handle(Input::Approved(true)).unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);
        assert!(sends(&actions).is_empty());
    }

    #[test]
    fn remote_cancel_overrides_in_flight_accept() {
        let (a, b) = identities();
        let (mut m, _) = SessionMachine::start_inbound(
            a,
            b.peer_id().clone(),
            SessionConfig::default(),
        );
        let actions = m.handle(Input::Approved(true)).unwrap();
        assert_eq!(m.state(), SessionState::Open);
        assert_eq!(sends(&actions), vec!["connection-accepted"]);

        // The cancellation crossed our accept on the wire: it still wins.
        m.handle(Input::ChannelData(wire(&Envelope::ConnectionCancelled)))
            .unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);
    }

    #[test]
    fn reject_sends_exactly_the_rejection_and_closes() {
        let (a, b) = identities();
        let (mut m, actions) = SessionMachine::start_inbound(
            a,
            b.peer_id().clone(),
            SessionConfig::default(),
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::AskApproval { .. })));

        let actions = m.handle(Input::Approved(false)).unwrap();
        assert_eq!(m.state(), SessionState::Rejected);
        assert_eq!(sends(&actions), vec!["connection-rejected"]);
        assert!(actions.iter().any(|a| matches!(a, Action::CloseChannel)));
    }

    #[test]
    fn remote_rejection_resolves_initiate_with_rejected() {
        let (a, b) = identities();
        let mut m = SessionMachine::new(a, SessionConfig::default());
        m.handle(Input::Initiate {
            remote: b.peer_id().clone(),
        })
        .unwrap();
        m.handle(Input::ChannelOpened).unwrap();

        let actions = m
            .handle(Input::ChannelData(wire(&Envelope::ConnectionRejected)))
            .unwrap();
        assert_eq!(m.state(), SessionState::Rejected);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ResolveInitiate(Err(SessionError::Rejected)))));
    }

    #[test]
    fn open_session_exchanges_text_both_ways() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        let actions = m
            .handle(Input::SendText {
                body: "hello".into(),
            })
            .unwrap();
        assert_eq!(sends(&actions), vec!["text"]);

        let actions = m
            .handle(Input::ChannelData(seal_text_from(&b, &a, "hi back")))
            .unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Notify(SessionEvent::MessageReceived(_)))));

        let log = m.messages();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sender, a.peer_id().clone());
        assert_eq!(log[0].content, MessageContent::Text("hello".into()));
        assert!(log[0].encrypted);
        assert_eq!(log[1].sender, b.peer_id().clone());
        assert_eq!(log[1].content, MessageContent::Text("hi back".into()));
    }

    #[test]
    fn tampered_payload_is_dropped_session_survives() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        let secret = derive_shared_secret(a.peer_id(), &b).unwrap();
        let sealed = pw_crypto::seal(b"genuine", &secret).unwrap();
        let mut corrupt = sealed.ciphertext.clone();
        corrupt[0] ^= 0xff;
        let envelope = Envelope::Text {
            nonce: hex::encode(sealed.nonce),
            encrypted: hex::encode(corrupt),
            content_type: pw_proto::TEXT_CONTENT_TYPE.into(),
        };

        let actions = m.handle(Input::ChannelData(wire(&envelope))).unwrap();
        assert!(actions.is_empty());
        assert_eq!(m.state(), SessionState::Open);
        assert!(m.messages().is_empty());

        // A good message still goes through afterwards.
        m.handle(Input::ChannelData(seal_text_from(&b, &a, "still here")))
            .unwrap();
        assert_eq!(m.messages().len(), 1);
    }

    #[test]
    fn garbage_and_unknown_envelopes_are_dropped() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        for junk in [&b"not json"[..], br#"{"kind":"warp-drive"}"#, b"{}"] {
            let actions = m.handle(Input::ChannelData(junk.to_vec())).unwrap();
            assert!(actions.is_empty());
            assert_eq!(m.state(), SessionState::Open);
        }
    }

    #[test]
    fn raw_file_is_logged_unencrypted() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        m.handle(Input::ChannelData(wire(&Envelope::raw_file(&[1, 2, 3]))))
            .unwrap();
        let log = m.messages();
        assert_eq!(log.len(), 1);
        assert!(!log[0].encrypted);
        assert_eq!(
            log[0].content,
            MessageContent::File {
                data: vec![1, 2, 3],
                content_type: RAW_FILE_CONTENT_TYPE.into()
            }
        );
    }

    #[test]
    fn encrypted_file_roundtrip_keeps_content_type() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        let secret = derive_shared_secret(a.peer_id(), &b).unwrap();
        let sealed = pw_crypto::seal(&[7u8; 64], &secret).unwrap();
        m.handle(Input::ChannelData(wire(&Envelope::encrypted_file(
            &sealed,
            "image/png",
        ))))
        .unwrap();

        let log = m.messages();
        assert_eq!(log.len(), 1);
        assert!(log[0].encrypted);
        assert_eq!(
            log[0].content,
            MessageContent::File {
                data: vec![7u8; 64],
                content_type: "image/png".into()
            }
        );
    }

    #[test]
    fn duplicate_control_envelopes_while_open_are_ignored() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        for envelope in [Envelope::ConnectionAccepted, Envelope::ConnectionRejected] {
            let actions = m.handle(Input::ChannelData(wire(&envelope))).unwrap();
            assert!(actions.is_empty());
            assert_eq!(m.state(), SessionState::Open);
        }
    }

    #[test]
    fn disconnect_notifies_clears_and_is_idempotent() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);
        m.handle(Input::SendText { body: "x".into() }).unwrap();
        assert_eq!(m.messages().len(), 1);

        let actions = m
            .handle(Input::Disconnect {
                initiated_by_user: true,
            })
            .unwrap();
        assert_eq!(m.state(), SessionState::Disconnected);
        assert_eq!(sends(&actions), vec!["disconnect-notify"]);
        assert!(m.messages().is_empty());

        let actions = m
            .handle(Input::Disconnect {
                initiated_by_user: true,
            })
            .unwrap();
        assert!(actions.is_empty());

        // Finished sessions can start over.
        m.handle(Input::Initiate {
            remote: b.peer_id().clone(),
        })
        .unwrap();
        assert_eq!(m.state(), SessionState::Connecting);
    }

    #[test]
    fn peer_vanishing_keeps_history_until_exit() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);
        m.handle(Input::ChannelData(seal_text_from(&b, &a, "last words")))
            .unwrap();

        let actions = m.handle(Input::ChannelClosed).unwrap();
        assert_eq!(m.state(), SessionState::PeerLeft);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::AskLeaveConfirm { .. })));
        assert_eq!(m.messages().len(), 1);

        // Declining keeps the history readable.
        m.handle(Input::LeaveConfirmed(false)).unwrap();
        assert_eq!(m.state(), SessionState::PeerLeft);
        assert_eq!(m.messages().len(), 1);

        // Sending is no longer possible.
        assert!(matches!(
            m.handle(Input::SendText { body: "?".into() }),
            Err(SessionError::NotConnected)
        ));

        // Exit finishes without re-confirming.
        m.handle(Input::Exit).unwrap();
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(m.messages().is_empty());
    }

    #[test]
    fn disconnect_notify_from_peer_triggers_confirmation() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        let actions = m
            .handle(Input::ChannelData(wire(&Envelope::disconnect_notify(
                b.peer_id().clone(),
            ))))
            .unwrap();
        assert_eq!(m.state(), SessionState::PeerLeft);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::AskLeaveConfirm { .. })));

        m.handle(Input::LeaveConfirmed(true)).unwrap();
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn approval_timeout_cancels_and_notifies_peer() {
        let (a, b) = identities();
        let (mut m, _) = SessionMachine::start_inbound(
            a,
            b.peer_id().clone(),
            SessionConfig::default(),
        );

        let actions = m.handle(Input::ApprovalTimedOut).unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);
        assert_eq!(sends(&actions), vec!["connection-cancelled"]);

        // The late human decision is ignored.
        let actions = m.handle(Input::Approved(true)).unwrap();
        assert!(actions.is_empty());
        assert_eq!(m.state(), SessionState::Cancelled);
    }

    #[test]
    fn channel_failure_maps_to_phase() {
        let (a, b) = identities();

        // During the handshake: cancel-equivalent.
        let mut m = SessionMachine::new(a.clone(), SessionConfig::default());
        m.handle(Input::Initiate {
            remote: b.peer_id().clone(),
        })
        .unwrap();
        m.handle(Input::ChannelFailed("ice melted".into())).unwrap();
        assert_eq!(m.state(), SessionState::Cancelled);

        // On an open session: disconnect-equivalent.
        let mut m = outbound_open(&a, &b);
        m.handle(Input::ChannelFailed("wire cut".into())).unwrap();
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn oversized_payloads_are_refused_without_traffic() {
        let (a, b) = identities();
        let mut m = outbound_open(&a, &b);

        let err = m.handle(Input::SendFile {
            bytes: vec![0u8; SessionConfig::default().max_payload_len + 1],
            content_type: "application/zip".into(),
            encrypt: true,
        });
        assert!(matches!(err, Err(SessionError::PayloadTooLarge(_))));
        assert!(m.messages().is_empty());
    }
}
