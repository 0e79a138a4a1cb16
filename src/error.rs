// Error handling module
// Defines the error taxonomy surfaced by the access core

use thiserror::Error;

/// Maximum number of characters of a response body carried in an error
pub const BODY_SNIPPET_LIMIT: usize = 512;

/// Errors that can occur while authenticating or executing a request
///
/// The type is `Clone` so a failed body read or a failed coalesced refresh
/// can be replayed to every caller that observes it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// Bad construction or request input. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Network-level failure (connect, DNS, reset, timeout)
    #[error("Transport error: {message}")]
    Transport { message: String, timeout: bool },

    /// The token endpoint refused the refresh grant
    #[error("Authentication rejected: {status} - {body_snippet}")]
    AuthRejected { status: u16, body_snippet: String },

    /// The server answered with something we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The response body stream failed while it was being buffered
    #[error("Body read error: {0}")]
    BodyRead(String),
}

impl AccessError {
    /// Build a transport error that is not a timeout
    pub fn transport(message: impl Into<String>) -> Self {
        AccessError::Transport {
            message: message.into(),
            timeout: false,
        }
    }

    /// Build a transport error for an operation that exceeded its deadline
    pub fn timed_out(message: impl Into<String>) -> Self {
        AccessError::Transport {
            message: message.into(),
            timeout: true,
        }
    }

    /// Build an `AuthRejected` error, truncating the body to a snippet
    pub fn auth_rejected(status: u16, body: &str) -> Self {
        AccessError::AuthRejected {
            status,
            body_snippet: snippet(body),
        }
    }

    /// True when the failure was caused by a deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, AccessError::Transport { timeout: true, .. })
    }

    /// True when retrying the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AccessError::Transport { .. })
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AccessError::AuthRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Truncate a body to at most `BODY_SNIPPET_LIMIT` characters
pub fn snippet(body: &str) -> String {
    match body.char_indices().nth(BODY_SNIPPET_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Result type alias for access operations
pub type Result<T> = std::result::Result<T, AccessError>;
