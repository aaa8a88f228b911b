use thiserror::Error;

use crate::machine::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Operation not legal in state {state:?}")]
    InvalidState { state: SessionState },

    #[error("No open session")]
    NotConnected,

    #[error("Connection rejected by peer")]
    Rejected,

    #[error("Connection cancelled")]
    Cancelled,

    #[error("Payload of {0} bytes exceeds the configured maximum")]
    PayloadTooLarge(usize),

    #[error("Channel failure: {0}")]
    Channel(String),

    #[error(transparent)]
    Crypto(#[from] pw_crypto::CryptoError),

    #[error("Session driver is gone")]
    Closed,
}
