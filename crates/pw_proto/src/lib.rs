//! pw_proto — Wire envelopes and serialisation for Peerwire
//!
//! Everything the channel carries is one [`Envelope`], serialised to JSON
//! and tagged on its `kind` field. The protocol is single-version: there is
//! no compatibility machinery, and unknown or malformed input decodes to a
//! [`WireError`] for the session layer to log and drop.
//!
//! # Modules
//! - `envelope` — the envelope sum type and its constructors
//! - `codec`    — encode/decode plus hex field helpers

pub mod codec;
pub mod envelope;

pub use codec::{decode, decode_hex, decode_nonce, encode, WireError};
pub use envelope::{Envelope, FilePayload, TEXT_CONTENT_TYPE};
