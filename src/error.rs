//! Beacon error types.
//!
//! Errors are grouped by where they originate:
//!
//! - **Transport**: open/send/close failures on the message channel
//! - **Decode**: inbound control messages that do not follow the protocol
//! - **Best-effort**: public IP lookup and identity store failures
//!
//! None of these escape the public session operations; the session driver
//! resolves them into log lines or state transitions. They surface as `Result`
//! values only from the lower-level building blocks.

use thiserror::Error;

use crate::protocol::DecodeError;

/// Beacon errors.
#[derive(Error, Debug)]
pub enum BeaconError {
    /// Configuration is missing or invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// Transport open/send/close failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound control message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Device identity store failure.
    #[error("Identity store error: {0}")]
    Identity(String),

    /// Public IP lookup failed or timed out.
    #[error("IP lookup error: {0}")]
    IpLookup(String),

    /// The session driver has shut down.
    #[error("Session closed")]
    SessionClosed,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for beacon operations
pub type Result<T> = std::result::Result<T, BeaconError>;

impl From<reqwest::Error> for BeaconError {
    fn from(err: reqwest::Error) -> Self {
        BeaconError::IpLookup(err.to_string())
    }
}

impl From<toml::de::Error> for BeaconError {
    fn from(err: toml::de::Error) -> Self {
        BeaconError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BeaconError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BeaconError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_converts() {
        let err: BeaconError = DecodeError::MissingType.into();
        assert!(matches!(err, BeaconError::Decode(DecodeError::MissingType)));
        assert!(err.to_string().starts_with("Decode error"));
    }

    #[test]
    fn test_toml_error_is_config() {
        let err: BeaconError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(matches!(err, BeaconError::Config(_)));
    }
}
