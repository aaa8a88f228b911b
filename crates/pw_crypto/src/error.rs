use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("AEAD encryption failed")]
    AeadSeal,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadOpen,

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
