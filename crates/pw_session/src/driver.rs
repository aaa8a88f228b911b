//! The per-session driver task.
//!
//! One tokio task owns the [`SessionMachine`], the channel halves, and the
//! caller-facing notification stream. Every caller command and every channel
//! event is funneled through ONE queue and applied strictly in arrival
//! order, so the machine never observes interleavings the queue did not —
//! the whole class of "cancel raced accept on two threads" bugs reduces to
//! the ordered sequences the machine is unit-tested against.
//!
//! The driver holds only a weak sender to its own queue; strong senders live
//! in the session handle, the channel forwarder, and in-flight prompt tasks.
//! When all of those are gone the queue drains and the task ends.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pw_crypto::{Identity, PeerId};
use pw_proto::{codec, Envelope};

use crate::{
    channel::{ChannelAdapter, ChannelEvent, ChannelPair, ChannelSender, IncomingChannel},
    config::SessionConfig,
    error::SessionError,
    machine::{Action, Input, MessageRecord, SessionEvent, SessionMachine, SessionState},
    prompt::UserPrompt,
};

/// Stream of caller notifications for one session.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

enum Command {
    Initiate {
        remote: PeerId,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    Cancel {
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        initiated_by_user: bool,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    Exit {
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    SendText {
        body: String,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    SendFile {
        bytes: Vec<u8>,
        content_type: String,
        encrypt: bool,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    State {
        resp: oneshot::Sender<SessionState>,
    },
    Messages {
        resp: oneshot::Sender<Vec<MessageRecord>>,
    },
}

enum DriverInput {
    Command(Command),
    Channel(ChannelEvent),
    Approval(bool),
    ApprovalTimedOut,
    Leave(bool),
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Caller-side handle to a running session. Cloneable; the session ends when
/// every clone is dropped and no channel activity remains.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<DriverInput>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(DriverInput::Command(build(resp_tx)))
            .map_err(|_| SessionError::Closed)?;
        resp_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Open a session to `remote`. Resolves once the peer accepts, errs with
    /// [`SessionError::Rejected`]/[`SessionError::Cancelled`]/a channel error
    /// otherwise. Abandoning the attempt must go through [`cancel`], not by
    /// dropping this future — the peer is owed a `connection-cancelled`.
    ///
    /// [`cancel`]: SessionHandle::cancel
    pub async fn initiate(&self, remote: PeerId) -> Result<(), SessionError> {
        self.request(|resp| Command::Initiate { remote, resp }).await?
    }

    /// Abort an unfinished handshake and notify the peer.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        self.request(|resp| Command::Cancel { resp }).await?
    }

    /// End an open session: best-effort farewell, then local teardown.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|resp| Command::Disconnect {
            initiated_by_user: true,
            resp,
        })
        .await?
    }

    /// Finish a session whose peer already left, without re-confirming.
    pub async fn exit(&self) -> Result<(), SessionError> {
        self.request(|resp| Command::Exit { resp }).await?
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<(), SessionError> {
        let body = body.into();
        self.request(|resp| Command::SendText { body, resp }).await?
    }

    pub async fn send_file(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        encrypt: bool,
    ) -> Result<(), SessionError> {
        let content_type = content_type.to_string();
        self.request(|resp| Command::SendFile {
            bytes,
            content_type,
            encrypt,
            resp,
        })
        .await?
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        self.request(|resp| Command::State { resp }).await
    }

    /// Snapshot of the session-scoped message history.
    pub async fn messages(&self) -> Result<Vec<MessageRecord>, SessionError> {
        self.request(|resp| Command::Messages { resp }).await
    }
}

// ── Spawning ─────────────────────────────────────────────────────────────────

/// Spawn a session ready to [`initiate`](SessionHandle::initiate) outbound
/// connections through `adapter`.
pub fn spawn_outbound(
    identity: Arc<Identity>,
    adapter: Arc<dyn ChannelAdapter>,
    prompt: Arc<dyn UserPrompt>,
    config: SessionConfig,
) -> (SessionHandle, SessionEvents) {
    let machine = SessionMachine::new(identity, config.clone());
    spawn(machine, Some(adapter), prompt, config, None, Vec::new())
}

/// Spawn a session for an inbound channel. The approval prompt fires
/// immediately.
pub fn spawn_inbound(
    identity: Arc<Identity>,
    incoming: IncomingChannel,
    prompt: Arc<dyn UserPrompt>,
    config: SessionConfig,
) -> (SessionHandle, SessionEvents) {
    let (machine, initial) =
        SessionMachine::start_inbound(identity, incoming.remote, config.clone());
    spawn(machine, None, prompt, config, Some(incoming.pair), initial)
}

fn spawn(
    machine: SessionMachine,
    adapter: Option<Arc<dyn ChannelAdapter>>,
    prompt: Arc<dyn UserPrompt>,
    config: SessionConfig,
    channel: Option<ChannelPair>,
    initial: Vec<Action>,
) -> (SessionHandle, SessionEvents) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mut driver = Driver {
        machine,
        adapter,
        prompt,
        config,
        input_tx: input_tx.downgrade(),
        events_tx,
        sender: None,
        forwarder: None,
        pending_initiate: None,
    };

    tokio::spawn(async move {
        if let Some(pair) = channel {
            driver.attach_channel(pair);
        }
        driver.exec_all(initial).await;
        driver.run(input_rx).await;
    });

    (SessionHandle { tx: input_tx }, events_rx)
}

// ── Driver ───────────────────────────────────────────────────────────────────

struct Driver {
    machine: SessionMachine,
    adapter: Option<Arc<dyn ChannelAdapter>>,
    prompt: Arc<dyn UserPrompt>,
    config: SessionConfig,
    input_tx: mpsc::WeakUnboundedSender<DriverInput>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    sender: Option<Box<dyn ChannelSender>>,
    forwarder: Option<JoinHandle<()>>,
    pending_initiate: Option<oneshot::Sender<Result<(), SessionError>>>,
}

impl Driver {
    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<DriverInput>) {
        while let Some(input) = input_rx.recv().await {
            match input {
                DriverInput::Command(cmd) => self.on_command(cmd).await,
                DriverInput::Channel(event) => {
                    let input = match event {
                        ChannelEvent::Open => Input::ChannelOpened,
                        ChannelEvent::Data(bytes) => Input::ChannelData(bytes),
                        ChannelEvent::Closed => Input::ChannelClosed,
                        ChannelEvent::Error(err) => Input::ChannelFailed(err),
                    };
                    self.step(input).await;
                }
                DriverInput::Approval(decision) => self.step(Input::Approved(decision)).await,
                DriverInput::ApprovalTimedOut => self.step(Input::ApprovalTimedOut).await,
                DriverInput::Leave(decision) => self.step(Input::LeaveConfirmed(decision)).await,
            }
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Initiate { remote, resp } => {
                match self.machine.handle(Input::Initiate { remote }) {
                    Ok(actions) => {
                        // Resolved later by Action::ResolveInitiate.
                        self.pending_initiate = Some(resp);
                        self.exec_all(actions).await;
                    }
                    Err(err) => {
                        let _ = resp.send(Err(err));
                    }
                }
            }
            Command::Cancel { resp } => self.command_step(Input::Cancel, resp).await,
            Command::Disconnect {
                initiated_by_user,
                resp,
            } => {
                self.command_step(Input::Disconnect { initiated_by_user }, resp)
                    .await
            }
            Command::Exit { resp } => self.command_step(Input::Exit, resp).await,
            Command::SendText { body, resp } => {
                self.command_step(Input::SendText { body }, resp).await
            }
            Command::SendFile {
                bytes,
                content_type,
                encrypt,
                resp,
            } => {
                self.command_step(
                    Input::SendFile {
                        bytes,
                        content_type,
                        encrypt,
                    },
                    resp,
                )
                .await
            }
            Command::State { resp } => {
                let _ = resp.send(self.machine.state());
            }
            Command::Messages { resp } => {
                let _ = resp.send(self.machine.messages());
            }
        }
    }

    /// Apply one command input: the caller learns the synchronous outcome,
    /// then the resulting actions run.
    async fn command_step(
        &mut self,
        input: Input,
        resp: oneshot::Sender<Result<(), SessionError>>,
    ) {
        match self.machine.handle(input) {
            Ok(actions) => {
                let _ = resp.send(Ok(()));
                self.exec_all(actions).await;
            }
            Err(err) => {
                let _ = resp.send(Err(err));
            }
        }
    }

    /// Apply one event input plus any feedback inputs its actions produce
    /// (e.g. a failed channel open feeding back as `ChannelFailed`).
    async fn step(&mut self, input: Input) {
        self.drain(VecDeque::from([input])).await;
    }

    async fn exec_all(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::new();
        for action in actions {
            if let Some(feedback) = self.exec(action).await {
                queue.push_back(feedback);
            }
        }
        self.drain(queue).await;
    }

    async fn drain(&mut self, mut queue: VecDeque<Input>) {
        while let Some(input) = queue.pop_front() {
            match self.machine.handle(input) {
                Ok(actions) => {
                    for action in actions {
                        if let Some(feedback) = self.exec(action).await {
                            queue.push_back(feedback);
                        }
                    }
                }
                Err(err) => debug!(error = %err, "event input rejected by machine"),
            }
        }
    }

    /// Execute one action. Returns a feedback input when the effect failed
    /// in a way the machine must hear about.
    async fn exec(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::OpenChannel { remote } => {
                let Some(adapter) = self.adapter.clone() else {
                    return Some(Input::ChannelFailed("no channel adapter".into()));
                };
                match adapter.open(&remote).await {
                    Ok(pair) => {
                        self.attach_channel(pair);
                        None
                    }
                    Err(err) => Some(Input::ChannelFailed(err.to_string())),
                }
            }
            Action::Send(envelope) => self.send_envelope(envelope, false).await,
            Action::SendBestEffort(envelope) => self.send_envelope(envelope, true).await,
            Action::CloseChannel => {
                if let Some(mut sender) = self.sender.take() {
                    sender.close().await;
                }
                if let Some(forwarder) = self.forwarder.take() {
                    forwarder.abort();
                }
                None
            }
            Action::AskApproval { remote } => {
                self.spawn_approval(remote);
                None
            }
            Action::AskLeaveConfirm { remote } => {
                self.spawn_leave_confirm(remote);
                None
            }
            Action::ResolveInitiate(result) => {
                if let Some(resp) = self.pending_initiate.take() {
                    let _ = resp.send(result);
                }
                None
            }
            Action::Notify(event) => {
                let _ = self.events_tx.send(event);
                None
            }
        }
    }

    async fn send_envelope(&mut self, envelope: Envelope, best_effort: bool) -> Option<Input> {
        let bytes = match codec::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, kind = envelope.kind(), "failed to encode envelope");
                return None;
            }
        };
        let Some(sender) = self.sender.as_mut() else {
            if best_effort {
                debug!(kind = envelope.kind(), "no channel for best-effort send");
                return None;
            }
            return Some(Input::ChannelFailed("send on missing channel".into()));
        };
        match sender.send(&bytes).await {
            Ok(()) => None,
            Err(err) if best_effort => {
                debug!(error = %err, kind = envelope.kind(), "best-effort send failed");
                None
            }
            Err(err) => Some(Input::ChannelFailed(err.to_string())),
        }
    }

    fn attach_channel(&mut self, pair: ChannelPair) {
        self.sender = Some(pair.sender);
        if let Some(previous) = self.forwarder.take() {
            previous.abort();
        }
        let Some(tx) = self.input_tx.upgrade() else {
            return;
        };
        let mut events = pair.events;
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closing = matches!(event, ChannelEvent::Closed);
                if tx.send(DriverInput::Channel(event)).is_err() {
                    return;
                }
                if closing {
                    return;
                }
            }
            // Transport dropped its sender without a farewell.
            let _ = tx.send(DriverInput::Channel(ChannelEvent::Closed));
        }));
    }

    fn spawn_approval(&self, remote: PeerId) {
        let Some(tx) = self.input_tx.upgrade() else {
            return;
        };
        let prompt = self.prompt.clone();
        let timeout = self.config.approval_timeout;
        tokio::spawn(async move {
            let decision = prompt.approve_connection(&remote);
            let input = match timeout {
                Some(limit) => match tokio::time::timeout(limit, decision).await {
                    Ok(decision) => DriverInput::Approval(decision),
                    Err(_) => DriverInput::ApprovalTimedOut,
                },
                None => DriverInput::Approval(decision.await),
            };
            let _ = tx.send(input);
        });
    }

    fn spawn_leave_confirm(&self, remote: PeerId) {
        let Some(tx) = self.input_tx.upgrade() else {
            return;
        };
        let prompt = self.prompt.clone();
        tokio::spawn(async move {
            let decision = prompt.confirm_leave(&remote).await;
            let _ = tx.send(DriverInput::Leave(decision));
        });
    }
}
