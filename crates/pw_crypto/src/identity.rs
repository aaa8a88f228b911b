//! Identity key management.
//!
//! Each party has one Ed25519 keypair. The public key, lowercase-hex encoded,
//! IS the party's address on the wire (`PeerId`) — identity and routing
//! address are deliberately the same thing.
//!
//! Regenerating an identity replaces the keypair wholesale; any session bound
//! to the old identity must be torn down first (enforced by the session
//! layer, not here).

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

// ── PeerId ───────────────────────────────────────────────────────────────────

/// A party's address: its Ed25519 public key, lowercase hex (64 chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl PeerId {
    /// Parse a peer id from its hex form. Accepts mixed case, stores lowercase.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "Peer id must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self(hex::encode(bytes)))
    }

    pub fn from_public_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw Ed25519 public key this id encodes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        // Length was validated at construction.
        out.copy_from_slice(&hex::decode(&self.0).expect("peer id holds valid hex"));
        out
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes (160 bits), hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.to_bytes());
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Identity keypair ─────────────────────────────────────────────────────────

/// Long-term identity key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    peer_id: PeerId,
    secret_bytes: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let peer_id = PeerId::from_public_bytes(&signing_key.verifying_key().to_bytes());
        Self {
            peer_id,
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Identity secret must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&arr);
        let peer_id = PeerId::from_public_bytes(&signing_key.verifying_key().to_bytes());
        Ok(Self {
            peer_id,
            secret_bytes: arr,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrip() {
        let id = Identity::generate();
        let parsed = PeerId::from_hex(id.peer_id().as_str()).unwrap();
        assert_eq!(&parsed, id.peer_id());
        assert_eq!(parsed.to_bytes().len(), PUBLIC_KEY_LEN);
    }

    #[test]
    fn peer_id_normalises_case() {
        let id = Identity::generate();
        let upper = id.peer_id().as_str().to_uppercase();
        let parsed = PeerId::from_hex(&upper).unwrap();
        assert_eq!(&parsed, id.peer_id());
    }

    #[test]
    fn peer_id_rejects_bad_lengths() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("zz").is_err());
        assert!(PeerId::from_hex(&"ab".repeat(33)).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_grouped() {
        let id = Identity::generate();
        let fp = id.peer_id().fingerprint();
        assert_eq!(fp, id.peer_id().fingerprint());
        assert_eq!(fp.split(' ').count(), 10);
    }

    #[test]
    fn regeneration_changes_peer_id() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }
}
