//! pw_crypto — Peerwire cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`  — long-term Ed25519 identity; the public key doubles as the
//!   peer's address (`PeerId`)
//! - `agreement` — shared-secret derivation between two identities (ECDH)
//! - `cipher`    — XChaCha20-Poly1305 seal/open helpers
//! - `kdf`       — HKDF-SHA256 expansion
//! - `error`     — unified error type

pub mod agreement;
pub mod cipher;
pub mod error;
pub mod identity;
pub mod kdf;

pub use agreement::{derive_shared_secret, SharedSecret};
pub use cipher::{open, seal, Sealed, NONCE_LEN};
pub use error::CryptoError;
pub use identity::{Identity, PeerId};
