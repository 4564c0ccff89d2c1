//! Error types for resilience primitives

use thiserror::Error;

/// Configuration validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Errors produced while guarding an operation
///
/// Generic over the wrapped operation's error so callers keep their own error
/// taxonomy and only add the guard-specific rejections.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open; the operation was not invoked
    #[error("Circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// The rate limiter was stopped while the call was queued or before it was
    /// submitted
    #[error("Rate limiter is stopped")]
    LimiterStopped,

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The wrapped operation error, if the operation ran.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            Self::CircuitOpen | Self::LimiterStopped => None,
        }
    }
}

pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

pub type ConfigResult<T> = Result<T, ConfigError>;
