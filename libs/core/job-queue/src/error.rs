//! Queue error types
//!
//! Connectivity errors recover through bounded reconnection; circuit-open
//! rejections are synthesized before the broker is touched; handler errors
//! are contained per message; store errors surface from the initial enqueue
//! insert but are swallowed (logged) during status bookkeeping.

use thiserror::Error;

/// Result alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by the job-queue subsystem
#[derive(Error, Debug)]
pub enum QueueError {
    /// AMQP connection or channel error
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// No active channel; the broker is down or not yet connected
    #[error("Broker not connected")]
    NotConnected,

    /// Job record store error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected pre-emptively by the circuit breaker
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    /// Job handler failed (business error during consumption)
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Create a handler error from any displayable cause.
    pub fn handler(message: impl Into<String>) -> Self {
        QueueError::Handler(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        QueueError::Internal(message.into())
    }

    /// Whether this error is a circuit-open rejection (the wrapped operation
    /// was never attempted).
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, QueueError::CircuitOpen(_))
    }
}

impl From<core_config::ConfigError> for QueueError {
    fn from(err: core_config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}
