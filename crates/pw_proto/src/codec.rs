//! Wire codec — JSON serialisation of envelopes plus hex field helpers.

use thiserror::Error;

use pw_crypto::NONCE_LEN;

use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid hex field: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid nonce length: expected {NONCE_LEN} bytes, got {0}")]
    NonceLength(usize),
}

/// Serialise an envelope to wire bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse wire bytes into an envelope. Unknown kinds and malformed records
/// are a `WireError`, never a panic — inbound bytes are attacker-controlled.
pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode a hex payload field.
pub fn decode_hex(field: &str) -> Result<Vec<u8>, WireError> {
    Ok(hex::decode(field)?)
}

/// Decode a hex nonce field into the fixed-size array the cipher expects.
pub fn decode_nonce(field: &str) -> Result<[u8; NONCE_LEN], WireError> {
    let bytes = hex::decode(field)?;
    if bytes.len() != NONCE_LEN {
        return Err(WireError::NonceLength(bytes.len()));
    }
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{FilePayload, TEXT_CONTENT_TYPE};
    use pw_crypto::{Identity, Sealed};

    #[test]
    fn bare_control_envelopes_are_exact() {
        // The rejection envelope in particular is pinned byte-for-byte: the
        // remote side matches on it to conclude the handshake.
        let encoded = encode(&Envelope::ConnectionRejected).unwrap();
        assert_eq!(encoded, br#"{"kind":"connection-rejected"}"#);

        let encoded = encode(&Envelope::ConnectionAccepted).unwrap();
        assert_eq!(encoded, br#"{"kind":"connection-accepted"}"#);

        let encoded = encode(&Envelope::ConnectionCancelled).unwrap();
        assert_eq!(encoded, br#"{"kind":"connection-cancelled"}"#);
    }

    #[test]
    fn disconnect_notify_carries_peer_id() {
        let id = Identity::generate();
        let env = Envelope::disconnect_notify(id.peer_id().clone());
        let bytes = encode(&env).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "disconnect-notify");
        assert_eq!(json["peerId"], id.peer_id().as_str());

        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn text_envelope_roundtrip() {
        let sealed = Sealed {
            nonce: [0xab; 24],
            ciphertext: vec![1, 2, 3, 255],
        };
        let env = Envelope::text(&sealed);
        let bytes = encode(&env).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["contentType"], TEXT_CONTENT_TYPE);
        assert_eq!(json["nonce"], "ab".repeat(24));
        assert_eq!(json["encrypted"], "010203ff");

        match decode(&bytes).unwrap() {
            Envelope::Text { nonce, encrypted, .. } => {
                assert_eq!(decode_nonce(&nonce).unwrap(), sealed.nonce);
                assert_eq!(decode_hex(&encrypted).unwrap(), sealed.ciphertext);
            }
            other => panic!("decoded wrong kind: {}", other.kind()),
        }
    }

    #[test]
    fn file_payload_shapes_are_unambiguous() {
        let sealed = Sealed {
            nonce: [1; 24],
            ciphertext: vec![9, 9, 9],
        };
        let encrypted = Envelope::encrypted_file(&sealed, "image/png");
        let raw = Envelope::raw_file(&[0xde, 0xad]);

        match decode(&encode(&encrypted).unwrap()).unwrap() {
            Envelope::File {
                payload: FilePayload::Encrypted { content_type, .. },
            } => assert_eq!(content_type, "image/png"),
            other => panic!("decoded wrong shape: {other:?}"),
        }

        match decode(&encode(&raw).unwrap()).unwrap() {
            Envelope::File {
                payload: FilePayload::Raw { data },
            } => assert_eq!(data, "dead"),
            other => panic!("decoded wrong shape: {other:?}"),
        }
    }

    #[test]
    fn hex_is_lowercase_even_length() {
        let env = Envelope::raw_file(&[0xAB, 0xCD, 0x01]);
        let bytes = encode(&env).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let data = json["data"].as_str().unwrap();
        assert_eq!(data, "abcd01");
        assert_eq!(data.len() % 2, 0);
    }

    #[test]
    fn unknown_kind_is_an_error_not_a_panic() {
        assert!(decode(br#"{"kind":"connection-imploded"}"#).is_err());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(decode(b"").is_err());
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"no":"kind"}"#).is_err());
        assert!(decode(br#"{"kind":"text"}"#).is_err());
        assert!(decode(br#"{"kind":"disconnect-notify","peerId":"abc"}"#).is_err());
    }

    #[test]
    fn nonce_length_is_enforced() {
        assert!(matches!(
            decode_nonce(&"ff".repeat(12)),
            Err(WireError::NonceLength(12))
        ));
        assert!(decode_nonce("zz").is_err());
        assert!(decode_nonce(&"00".repeat(24)).is_ok());
    }
}
