//! Unified error system for Ferry
//!
//! One error type covers the whole rendezvous layer. Synchronous misuse
//! (`InvalidState`, `UnsupportedProtocol`, `KeyInUse`, ...) is returned to the
//! caller; failures on background delivery paths close the affected channel
//! and are recorded as its close reason.

use serde::{Deserialize, Serialize};

/// Unified error type for all Ferry operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FerryError {
    /// Operation is not allowed in the channel's current state
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: String,
        /// State the channel was in
        state: String,
    },

    /// The peer offered no role this channel can take
    #[error("No compatible protocol in {offered:?}")]
    UnsupportedProtocol {
        /// Protocol names the peer advertised
        offered: Vec<String>,
    },

    /// Negotiation message is structurally inconsistent
    #[error("Malformed negotiation message: {message}")]
    MalformedMessage {
        /// What was wrong with the message
        message: String,
    },

    /// A pending connection is already registered under this key
    #[error("Key already in use: {key}")]
    KeyInUse {
        /// The conflicting key
        key: String,
    },

    /// Dial, send or receive failed at the transport level
    #[error("Transport error: {message}")]
    Transport {
        /// Error message describing the transport failure
        message: String,
    },

    /// The peer's first message was not the control token
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// Error message describing the violation
        message: String,
    },

    /// No transport arrived before the pending-connection deadline
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message describing what timed out
        message: String,
    },

    /// Public address lookup failed
    #[error("Address resolution failed: {message}")]
    Resolution {
        /// Error message describing the lookup failure
        message: String,
    },

    /// Invalid configuration value or unreadable config file
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration problem
        message: String,
    },

    /// The process-wide rendezvous service was initialized twice
    #[error("Rendezvous service already initialized")]
    AlreadyInitialized,
}

impl FerryError {
    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: format!("{state:?}"),
        }
    }

    /// Create an unsupported protocol error
    pub fn unsupported_protocol(offered: &[String]) -> Self {
        Self::UnsupportedProtocol {
            offered: offered.to_vec(),
        }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create a key in use error
    pub fn key_in_use(key: impl Into<String>) -> Self {
        Self::KeyInUse { key: key.into() }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an address resolution error
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the error was returned synchronously for caller misuse
    /// rather than produced by the network.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::UnsupportedProtocol { .. }
                | Self::MalformedMessage { .. }
                | Self::KeyInUse { .. }
                | Self::AlreadyInitialized
        )
    }
}

/// Standard Result type for Ferry operations
pub type Result<T> = std::result::Result<T, FerryError>;

impl From<std::io::Error> for FerryError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FerryError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<url::ParseError> for FerryError {
    fn from(err: url::ParseError) -> Self {
        Self::malformed(format!("invalid rendezvous URL: {err}"))
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

impl From<toml::de::Error> for FerryError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("Invalid TOML: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        #[derive(Debug)]
        enum Fake {
            Initiated,
        }
        let err = FerryError::invalid_state("request", Fake::Initiated);
        assert_eq!(
            err.to_string(),
            "Invalid state: cannot request while Initiated"
        );
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = FerryError::from(io_err);
        assert!(matches!(err, FerryError::Transport { .. }));
        assert!(!err.is_usage_error());
    }

    #[test]
    fn test_url_error_is_malformed() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        assert!(matches!(
            FerryError::from(parse_err),
            FerryError::MalformedMessage { .. }
        ));
    }
}
