//! Error types for the direct-messaging client runtime
//!
//! Each concern owns its own error enum (`ConfigError` in [`crate::config`],
//! `TransportError` in [`crate::transport`], `ListenerError` in
//! [`crate::events`]). This module holds the connect-time error surfaced by
//! [`crate::connection::ConnectionManager::connect`] and the umbrella
//! [`ClientError`] used by the remaining fallible operations.

use crate::config::ConfigError;
use crate::connection::ConnectionState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Terminal failure of a `connect` call. Never retried by the manager itself.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transport unreachable: {0}")]
    TransportUnreachable(String),

    #[error("Connection handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cannot connect while {0}")]
    InvalidState(ConnectionState),

    #[error("Connection attempt aborted by forced disconnect")]
    Aborted,
}

impl ConnectError {
    /// Map a handshake failure reported by the transport
    pub fn from_transport(error: &TransportError, handshake_timeout: Duration) -> Self {
        match error {
            TransportError::AuthenticationFailed(reason) => {
                ConnectError::AuthenticationFailed(sanitize_error_message(reason))
            }
            TransportError::Timeout => ConnectError::Timeout(handshake_timeout),
            other => ConnectError::TransportUnreachable(sanitize_error_message(&other.to_string())),
        }
    }
}

/// Umbrella error for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: String,
    },
}

impl ClientError {
    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn illegal_state<S: ToString>(operation: &'static str, state: S) -> Self {
        Self::IllegalState {
            operation,
            state: state.to_string(),
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

const MAX_MESSAGE_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+")
        .expect("secret pattern is a valid regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is a valid regex")
});

/// Redact credentials and sensitive paths from text that ends up in
/// service events and logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
