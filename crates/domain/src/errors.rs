//! Error types used throughout the client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Ticketline
///
/// Every public operation resolves to a typed value or one of these kinds.
/// Classification helpers below drive the rate limiter's retry decisions.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum TicketlineError {
    /// Handshake or session validation failed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Upstream throttled the call (HTTP 429/503)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The circuit breaker rejected the call without reaching the transport
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Network failure or upstream 5xx
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport call exceeded its timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Semantic rejection from upstream (4xx), surfaced verbatim
    #[error("Remote query rejected ({status}): {message}")]
    RemoteQuery { status: u16, message: String },

    /// Local value coercion failed
    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Operation not valid for the current cursor or session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// At least one row of a batch operation failed; successes are kept
    #[error("Batch incomplete: {succeeded} succeeded, {} failed", .failures.len())]
    BatchIncomplete { succeeded: usize, failures: Vec<RowFailure> },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome of one failed row in a batch operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub sys_id: String,
    pub error: String,
}

impl TicketlineError {
    /// Map an HTTP status from the table API onto an error kind.
    ///
    /// Returns `None` for success codes.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match status {
            200..=399 => None,
            401 | 403 => Some(Self::Authentication(message)),
            429 | 503 => Some(Self::RateLimited(message)),
            500..=599 => Some(Self::Transport(format!("HTTP {status}: {message}"))),
            _ => Some(Self::RemoteQuery { status, message }),
        }
    }

    /// Whether this failure should be retried as a throttling response.
    ///
    /// Falls back to message matching for transports that do not surface a
    /// status code.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::Transport(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("429")
                    || msg.contains("503")
                    || msg.contains("rate limit")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }

    /// Whether this failure is transient (timeout, connection reset, 5xx).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for TicketlineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

/// Result type alias for Ticketline operations
pub type Result<T> = std::result::Result<T, TicketlineError>;
