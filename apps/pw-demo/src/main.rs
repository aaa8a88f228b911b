//! Headless demo: two endpoints on an in-process channel run the whole
//! lifecycle — connect, approve, exchange a text and a file, disconnect.
//! This is the seam a UI shell would attach to.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use pw_crypto::Identity;
use pw_session::{
    memory::MemoryHub, AutoApprove, Endpoint, MessageContent, SessionConfig, SessionEvent,
    SessionState,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pw_session=debug".into()),
        )
        .init();

    let hub = MemoryHub::new();
    let config = SessionConfig {
        approval_timeout: Some(Duration::from_secs(30)),
        ..SessionConfig::default()
    };

    let alice_identity = Arc::new(Identity::generate());
    let (alice_adapter, _alice_inbox) = hub.register(alice_identity.peer_id().clone());
    let alice = Arc::new(Endpoint::new(
        alice_identity.clone(),
        Arc::new(alice_adapter),
        Arc::new(AutoApprove),
        config.clone(),
    ));

    let bob_identity = Arc::new(Identity::generate());
    let (bob_adapter, mut bob_inbox) = hub.register(bob_identity.peer_id().clone());
    let bob = Arc::new(Endpoint::new(
        bob_identity.clone(),
        Arc::new(bob_adapter),
        Arc::new(AutoApprove),
        config,
    ));

    info!(peer = %alice.peer_id().await, fingerprint = %alice.fingerprint().await, "alice is up");
    info!(peer = %bob.peer_id().await, fingerprint = %bob.fingerprint().await, "bob is up");

    // Bob answers the door; Alice knocks.
    let bob_endpoint = bob.clone();
    let bob_side = tokio::spawn(async move {
        let incoming = bob_inbox.recv().await.context("no inbound channel")?;
        let (session, mut events) = bob_endpoint
            .accept_incoming(incoming)
            .await
            .context("endpoint was busy")?;

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::MessageReceived(record) => match &record.content {
                    MessageContent::Text(body) => {
                        info!(from = %record.sender, encrypted = record.encrypted, "bob got text: {body}");
                        if body.contains("hello") {
                            session.send_text("hello yourself").await?;
                        }
                    }
                    MessageContent::File { data, content_type } => {
                        info!(
                            from = %record.sender,
                            bytes = data.len(),
                            content_type = %content_type,
                            encrypted = record.encrypted,
                            "bob got a file"
                        );
                    }
                },
                SessionEvent::StateChanged(state) => {
                    info!(?state, "bob's session moved");
                    if state == SessionState::Disconnected {
                        break;
                    }
                }
                SessionEvent::PeerLeft(peer) => {
                    info!(%peer, "bob's peer left");
                }
            }
        }
        anyhow::Ok(())
    });

    let (session, mut events) = alice
        .connect(bob.peer_id().await)
        .await
        .context("handshake failed")?;
    info!("alice's session is open");

    session.send_text("hello bob").await?;
    session
        .send_file(b"PNG-not-really".to_vec(), "image/png", true)
        .await?;

    // Wait for Bob's reply before hanging up.
    while let Some(event) = events.recv().await {
        if let SessionEvent::MessageReceived(record) = event {
            if let MessageContent::Text(body) = &record.content {
                if &record.sender != alice_identity.peer_id() {
                    info!(from = %record.sender, "alice got text: {body}");
                    break;
                }
            }
        }
    }

    let history = session.messages().await?;
    info!(entries = history.len(), "alice's history before hanging up");

    session.disconnect().await?;
    info!("alice disconnected");

    bob_side.await??;
    Ok(())
}
