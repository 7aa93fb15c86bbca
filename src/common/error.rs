//! Error types for replication and delivery operations
//!
//! Classifies failures so callers can decide between local retry,
//! surfacing to an operator, and per-consumer isolation.

use crate::postgres::protocol::DecodeError;
use crate::subject::SubjectError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Replication protocol / WAL decoding failures
    Replication,
    /// Subject or pattern validation failures
    Subject,
    /// Message log write races and constraint conflicts
    Log,
    /// Sink delivery failures
    Delivery,
    /// Configuration errors
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Serialization errors
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Errors produced by the replication pipeline, the message log, and the
/// dispatch engine.
#[derive(Error, Debug)]
pub enum RiffleError {
    /// Malformed subject or pattern, rejected at the input boundary
    #[error("Invalid subject: {0}")]
    Subject(#[from] SubjectError),

    /// Replication connection or protocol failure
    #[error("Replication error: {0}")]
    Replication(String),

    /// Undecodable WAL payload; fatal for the owning slot
    #[error("WAL decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Concurrent write race on the log; resolved by retrying the upsert
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Delivery attempt failed but may succeed later
    #[error("Sink retryable error: {0}")]
    SinkRetryable(String),

    /// Delivery permanently rejected by the sink
    #[error("Sink fatal error: {0}")]
    SinkFatal(String),

    /// Unknown consumer, message, or checkpoint reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate start for a slot or consumer that is already running
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid internal state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RiffleError {
    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a constraint violation error
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create a retryable sink error
    pub fn sink_retryable(msg: impl Into<String>) -> Self {
        Self::SinkRetryable(msg.into())
    }

    /// Create a fatal sink error
    pub fn sink_fatal(msg: impl Into<String>) -> Self {
        Self::SinkFatal(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient failures that may succeed on retry:
    /// network errors, timeouts, write races, and retryable sink errors.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Timeout(_) => true,
            Self::Constraint(_) => true,
            Self::SinkRetryable(_) => true,

            Self::Replication(msg) => {
                msg.contains("connection reset")
                    || msg.contains("connection lost")
                    || msg.contains("temporarily")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::UnexpectedEof
                )
            }

            Self::Subject(_)
            | Self::Decode(_)
            | Self::SinkFatal(_)
            | Self::NotFound(_)
            | Self::AlreadyRunning(_)
            | Self::Config(_)
            | Self::InvalidState(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Check if this error is a data-integrity failure that must stop the
    /// owning unit rather than be retried.
    ///
    /// Continuing past a decode or subject failure would silently corrupt
    /// per-stream ordering, so these are surfaced instead of skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Subject(_) | Self::Json(_))
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Subject(_) => ErrorCategory::Subject,
            Self::Replication(_) | Self::Decode(_) => ErrorCategory::Replication,
            Self::Constraint(_) | Self::NotFound(_) => ErrorCategory::Log,
            Self::SinkRetryable(_) | Self::SinkFatal(_) => ErrorCategory::Delivery,
            Self::Config(_) | Self::AlreadyRunning(_) => ErrorCategory::Configuration,
            Self::Timeout(_) | Self::ConnectionClosed | Self::Io(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Subject(_) => "invalid_subject",
            Self::Replication(_) => "replication_error",
            Self::Decode(_) => "decode_error",
            Self::Constraint(_) => "constraint_violation",
            Self::SinkRetryable(_) => "sink_retryable",
            Self::SinkFatal(_) => "sink_fatal",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::Config(_) => "config_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for riffle operations
pub type Result<T> = std::result::Result<T, RiffleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RiffleError::replication("connection lost");
        assert!(err.to_string().contains("Replication error"));
        assert!(err.to_string().contains("connection lost"));
    }

    #[test]
    fn test_is_retriable() {
        assert!(RiffleError::ConnectionClosed.is_retriable());
        assert!(RiffleError::timeout("5s").is_retriable());
        assert!(RiffleError::constraint("seq race").is_retriable());
        assert!(RiffleError::sink_retryable("503").is_retriable());

        assert!(!RiffleError::sink_fatal("410 gone").is_retriable());
        assert!(!RiffleError::config("bad slot name").is_retriable());
        assert!(!RiffleError::not_found("consumer x").is_retriable());
    }

    #[test]
    fn test_is_fatal() {
        let err = RiffleError::Subject(SubjectError::Empty);
        assert!(err.is_fatal());
        assert!(!err.is_retriable());

        assert!(!RiffleError::ConnectionClosed.is_fatal());
        assert!(!RiffleError::sink_fatal("rejected").is_fatal());
    }

    #[test]
    fn test_category() {
        assert_eq!(
            RiffleError::replication("x").category(),
            ErrorCategory::Replication
        );
        assert_eq!(
            RiffleError::sink_fatal("x").category(),
            ErrorCategory::Delivery
        );
        assert_eq!(
            RiffleError::ConnectionClosed.category(),
            ErrorCategory::Network
        );
        assert_eq!(RiffleError::constraint("x").category(), ErrorCategory::Log);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(RiffleError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(RiffleError::sink_retryable("x").error_code(), "sink_retryable");
        assert_eq!(RiffleError::config("x").error_code(), "config_error");
    }
}
