//! Protocol envelopes — the only thing ever written to a channel.
//!
//! Wire shapes (JSON, hex fields lowercase and even length):
//!
//! ```text
//! {"kind": "connection-accepted"}
//! {"kind": "connection-rejected"}
//! {"kind": "connection-cancelled"}
//! {"kind": "disconnect-notify", "peerId": "<hex>"}
//! {"kind": "text", "nonce": "<hex>", "encrypted": "<hex>", "contentType": "text/plain"}
//! {"kind": "file", "nonce": "<hex>", "encrypted": "<hex>", "contentType": "<mime>"}
//! {"kind": "file", "data": "<hex>"}
//! ```
//!
//! The two `file` shapes are distinguished structurally (disjoint field
//! sets), never by sniffing payload content.

use serde::{Deserialize, Serialize};

use pw_crypto::{PeerId, Sealed};

/// Content type stamped on encrypted text payloads.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// A typed protocol message. Immutable once constructed; produced by the
/// sender, consumed exactly once by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    ConnectionAccepted,
    ConnectionRejected,
    ConnectionCancelled,
    DisconnectNotify {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Text {
        nonce: String,
        encrypted: String,
        #[serde(rename = "contentType")]
        content_type: String,
    },
    File {
        #[serde(flatten)]
        payload: FilePayload,
    },
}

/// Encrypted vs explicitly-unencrypted file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilePayload {
    Encrypted {
        nonce: String,
        encrypted: String,
        #[serde(rename = "contentType")]
        content_type: String,
    },
    Raw {
        data: String,
    },
}

impl Envelope {
    pub fn text(sealed: &Sealed) -> Self {
        Envelope::Text {
            nonce: hex::encode(sealed.nonce),
            encrypted: hex::encode(&sealed.ciphertext),
            content_type: TEXT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn encrypted_file(sealed: &Sealed, content_type: &str) -> Self {
        Envelope::File {
            payload: FilePayload::Encrypted {
                nonce: hex::encode(sealed.nonce),
                encrypted: hex::encode(&sealed.ciphertext),
                content_type: content_type.to_string(),
            },
        }
    }

    pub fn raw_file(bytes: &[u8]) -> Self {
        Envelope::File {
            payload: FilePayload::Raw {
                data: hex::encode(bytes),
            },
        }
    }

    pub fn disconnect_notify(peer_id: PeerId) -> Self {
        Envelope::DisconnectNotify { peer_id }
    }

    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ConnectionAccepted => "connection-accepted",
            Envelope::ConnectionRejected => "connection-rejected",
            Envelope::ConnectionCancelled => "connection-cancelled",
            Envelope::DisconnectNotify { .. } => "disconnect-notify",
            Envelope::Text { .. } => "text",
            Envelope::File { .. } => "file",
        }
    }
}
