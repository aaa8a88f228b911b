//! Shared-secret derivation between two identities.
//!
//! Both parties hold an Ed25519 keypair whose public half doubles as their
//! `PeerId`. For key agreement the keys are mapped onto Curve25519:
//!
//!   - the local Ed25519 secret becomes an X25519 scalar via the clamped
//!     SHA-512 expansion (RFC 7748 §5), mirroring libsignal's IK conversion;
//!   - the peer's public key is a compressed Edwards point and MUST be
//!     decompressed before the birational map to its Montgomery form —
//!     skipping decompression would not fail loudly, it would produce a
//!     different secret on each side.
//!
//! The raw X25519 output is then expanded through HKDF-SHA256 into the
//! 32-byte session secret. ECDH commutativity gives the core correctness
//! property: `derive(pub_B, priv_A) == derive(pub_A, priv_B)`.

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    error::CryptoError,
    identity::{Identity, PeerId},
    kdf,
};

/// Size of a derived shared secret in bytes.
pub const SHARED_SECRET_LEN: usize = 32;

const HKDF_INFO: &[u8] = b"peerwire-shared-secret-v1";

/// Symmetric key material for one session. Zeroized on drop, never printed.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret
/// using the clamped SHA-512 expansion that ed25519-dalek applies internally.
fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (compressed Edwards point) to an X25519
/// public key. Decompression is mandatory: the Montgomery form only exists
/// for the full point, not its compressed encoding.
fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    let montgomery = point.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

/// Derive the session secret shared between `own` and the peer addressed by
/// `peer_public`.
///
/// Fails with `CryptoError::InvalidKey` on undecodable or off-curve peer
/// keys, and with `CryptoError::KeyAgreement` when the exchange degenerates
/// (low-order peer point). Never returns a secret derived from
/// partially-invalid input.
pub fn derive_shared_secret(
    peer_public: &PeerId,
    own: &Identity,
) -> Result<SharedSecret, CryptoError> {
    let peer_x = ed25519_pub_to_x25519(&peer_public.to_bytes())?;
    let own_x = ed25519_secret_to_x25519(own.secret_bytes());

    let dh = own_x.diffie_hellman(&peer_x);
    if !dh.was_contributory() {
        return Err(CryptoError::KeyAgreement(
            "low-order peer public key".into(),
        ));
    }

    let mut out = [0u8; SHARED_SECRET_LEN];
    kdf::hkdf_expand(dh.as_bytes(), None, HKDF_INFO, &mut out)?;
    Ok(SharedSecret(out))
}
