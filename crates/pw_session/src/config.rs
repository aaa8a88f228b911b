//! Session tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on how long an inbound connection may sit awaiting the local
    /// human decision. `None` reproduces the reference behavior: suspend
    /// indefinitely. When set, expiry cancels the handshake and notifies the
    /// peer with `connection-cancelled`.
    pub approval_timeout: Option<Duration>,

    /// Upper bound on a single text or file payload, pre-encryption.
    pub max_payload_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            approval_timeout: None,
            max_payload_len: 8 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_approval_timeout() {
        let config = SessionConfig::default();
        assert!(config.approval_timeout.is_none());
        assert!(config.max_payload_len > 0);
    }

    #[test]
    fn serialises_roundtrip() {
        let config = SessionConfig {
            approval_timeout: Some(Duration::from_secs(90)),
            max_payload_len: 1024,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.approval_timeout, Some(Duration::from_secs(90)));
        assert_eq!(back.max_payload_len, 1024);
    }
}
