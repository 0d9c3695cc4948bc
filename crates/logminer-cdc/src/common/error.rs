//! Error types for log mining operations
//!
//! Every failure the mining core can raise is a [`CdcError`]. The orchestrator
//! is the only place that decides between restart-from-checkpoint and a
//! terminal stop, using [`CdcError::is_retriable`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller supplied bad input (positions, patterns, settings)
    Input,
    /// Backend metadata, registration or session failures
    Backend,
    /// Connection loss and timeouts
    Network,
    /// Payload decoding and serialization
    Decoding,
    /// Downstream consumer backpressure
    Consumer,
    /// Checkpoint persistence
    Storage,
    /// Other/unknown errors
    Other,
}

/// Log mining errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// A position could not be parsed from its text form
    #[error("Malformed position: {0}")]
    MalformedPosition(String),

    /// Backend metadata (log catalog) could not be queried
    #[error("No catalog access: {0}")]
    NoCatalogAccess(String),

    /// Segment registration failed or left a gap in the mined range
    #[error("Segment registration failed: {0}")]
    SegmentRegistration(String),

    /// The backend refused to start a mining session
    #[error("Session start failed: {0}")]
    SessionStart(String),

    /// The consumer did not accept an event
    #[error("Consumer rejected event: {0}")]
    ConsumerRejected(String),

    /// A raw row or payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Generic database error reported by a connection adapter
    #[error("Database error: {0}")]
    Database(String),

    /// PostgreSQL driver error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filter pattern error
    #[error("Filter error: {0}")]
    Filter(String),

    /// Checkpoint store error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Work was cancelled by a stop request
    #[error("Cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    /// Create a malformed position error
    pub fn malformed_position(msg: impl Into<String>) -> Self {
        Self::MalformedPosition(msg.into())
    }

    /// Create a catalog access error
    pub fn no_catalog_access(msg: impl Into<String>) -> Self {
        Self::NoCatalogAccess(msg.into())
    }

    /// Create a segment registration error
    pub fn segment_registration(msg: impl Into<String>) -> Self {
        Self::SegmentRegistration(msg.into())
    }

    /// Create a session start error
    pub fn session_start(msg: impl Into<String>) -> Self {
        Self::SessionStart(msg.into())
    }

    /// Create a consumer rejection error
    pub fn consumer_rejected(msg: impl Into<String>) -> Self {
        Self::ConsumerRejected(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a filter error
    pub fn filter(msg: impl Into<String>) -> Self {
        Self::Filter(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Re-label a raw database failure as a mining-stage error.
    ///
    /// Driver and adapter errors (`Database`, `Postgres`, `Other`) become
    /// `wrap(message)`. Connection loss, cancellation and errors that
    /// already name a stage pass through unchanged.
    pub fn into_backend_error(self, wrap: fn(String) -> CdcError) -> Self {
        match self {
            Self::Database(msg) | Self::Other(msg) => wrap(msg),
            #[cfg(feature = "postgres")]
            Self::Postgres(e) if !e.is_closed() && e.as_db_error().is_some() => wrap(e.to_string()),
            other => other,
        }
    }

    /// Check if this error is retriable.
    ///
    /// Retriable errors restart the mining loop from the last checkpoint on a
    /// fresh connection. Everything else is surfaced to the caller.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::NoCatalogAccess(_)
            | Self::SegmentRegistration(_)
            | Self::SessionStart(_)
            | Self::ConsumerRejected(_)
            | Self::Database(_)
            | Self::Checkpoint(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed => true,

            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::MalformedPosition(_)
            | Self::Decode(_)
            | Self::Config(_)
            | Self::Filter(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Cancelled
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedPosition(_) | Self::Config(_) | Self::Filter(_) => ErrorCategory::Input,
            Self::NoCatalogAccess(_)
            | Self::SegmentRegistration(_)
            | Self::SessionStart(_)
            | Self::Database(_) => ErrorCategory::Backend,
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => ErrorCategory::Backend,
            Self::Timeout(_) | Self::ConnectionClosed | Self::Io(_) => ErrorCategory::Network,
            Self::Decode(_) | Self::Serialization(_) | Self::Json(_) => ErrorCategory::Decoding,
            Self::ConsumerRejected(_) => ErrorCategory::Consumer,
            Self::Checkpoint(_) => ErrorCategory::Storage,
            Self::InvalidState(_) | Self::Cancelled | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedPosition(_) => "malformed_position",
            Self::NoCatalogAccess(_) => "no_catalog_access",
            Self::SegmentRegistration(_) => "segment_registration",
            Self::SessionStart(_) => "session_start",
            Self::ConsumerRejected(_) => "consumer_rejected",
            Self::Decode(_) => "decode_error",
            Self::Database(_) => "database_error",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres_error",
            Self::Config(_) => "config_error",
            Self::Filter(_) => "filter_error",
            Self::Checkpoint(_) => "checkpoint_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "unknown",
        }
    }
}

/// Check if a PostgreSQL error is transient.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // connection exception, transaction rollback, insufficient resources
        if code.starts_with("08") || code.starts_with("40") || code.starts_with("53") {
            return true;
        }
        // operator intervention, except query_canceled
        return code.starts_with("57") && code != "57014";
    }
    // no server error attached: I/O or protocol failure on the socket
    true
}

/// Result type for log mining operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::no_catalog_access("ORA-01031: insufficient privileges");
        assert!(err.to_string().contains("No catalog access"));
        assert!(err.to_string().contains("ORA-01031"));
    }

    #[test]
    fn test_backend_errors_are_retriable() {
        assert!(CdcError::no_catalog_access("x").is_retriable());
        assert!(CdcError::segment_registration("x").is_retriable());
        assert!(CdcError::session_start("x").is_retriable());
        assert!(CdcError::consumer_rejected("x").is_retriable());
        assert!(CdcError::ConnectionClosed.is_retriable());
        assert!(CdcError::timeout("5s").is_retriable());
    }

    #[test]
    fn test_input_errors_are_terminal() {
        assert!(!CdcError::malformed_position("abc").is_retriable());
        assert!(!CdcError::decode("truncated").is_retriable());
        assert!(!CdcError::config("bad").is_retriable());
        assert!(!CdcError::filter("bad").is_retriable());
        assert!(!CdcError::Cancelled.is_retriable());
    }

    #[test]
    fn test_io_retriable_by_kind() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(CdcError::from(reset).is_retriable());
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!CdcError::from(missing).is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CdcError::malformed_position("x").category(),
            ErrorCategory::Input
        );
        assert_eq!(
            CdcError::session_start("x").category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            CdcError::ConnectionClosed.category(),
            ErrorCategory::Network
        );
        assert_eq!(
            CdcError::consumer_rejected("x").category(),
            ErrorCategory::Consumer
        );
        assert_eq!(CdcError::checkpoint("x").category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_into_backend_error() {
        let wrapped = CdcError::database("ORA-01291: missing logfile")
            .into_backend_error(CdcError::SessionStart);
        assert!(matches!(wrapped, CdcError::SessionStart(ref m) if m.contains("ORA-01291")));

        let passthrough = CdcError::ConnectionClosed.into_backend_error(CdcError::SessionStart);
        assert!(matches!(passthrough, CdcError::ConnectionClosed));

        let staged = CdcError::segment_registration("gap")
            .into_backend_error(CdcError::NoCatalogAccess);
        assert!(matches!(staged, CdcError::SegmentRegistration(_)));
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CdcError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(
            CdcError::segment_registration("x").error_code(),
            "segment_registration"
        );
        assert_eq!(CdcError::decode("x").error_code(), "decode_error");
    }
}
