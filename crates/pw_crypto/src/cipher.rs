//! Authenticated encryption for session payloads.
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! The nonce is generated inside [`seal`] and returned next to the
//! ciphertext — callers never supply one, so nonce reuse under a given
//! secret is structurally impossible. The wire format carries nonce and
//! ciphertext as separate fields, hence the split [`Sealed`] shape.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305, XNonce,
};

use crate::{agreement::SharedSecret, error::CryptoError};

/// Nonce length of XChaCha20-Poly1305 in bytes.
pub const NONCE_LEN: usize = 24;

/// One encrypted payload: a fresh random nonce plus ciphertext-with-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under the session secret with a fresh 24-byte nonce.
/// Works uniformly over UTF-8 text and raw file bytes.
pub fn seal(plaintext: &[u8], secret: &SharedSecret) -> Result<Sealed, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(secret.as_bytes())
        .map_err(|_| CryptoError::AeadSeal)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::AeadSeal)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    Ok(Sealed {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a payload. Tampering with either nonce or ciphertext, or using a
/// wrong key, yields `CryptoError::AeadOpen` — an expected outcome on
/// attacker-controlled input, to be handled per message rather than treated
/// as a session failure.
pub fn open(
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    secret: &SharedSecret,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(secret.as_bytes())
        .map_err(|_| CryptoError::AeadOpen)?;

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AeadOpen)
}
