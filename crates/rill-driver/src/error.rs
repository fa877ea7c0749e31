//! Error types for rill-driver
//!
//! Driver errors keep a retryable flag on query failures so callers can
//! distinguish transient backend conditions (serialization failures,
//! deadlocks, shutdown races) from fatal ones. Classification is
//! informational only: no retry happens below the caller.

use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for driver operations
#[derive(Error, Debug)]
pub enum Error {
    /// Driver configuration failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Establishing or validating the backend session failed
    #[error("connect error: {0}")]
    Connect(String),

    /// Query submission or execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        /// Whether the backend reported a transient condition
        retryable: bool,
    },

    /// Row iteration failed after the query started streaming
    #[error("stream error: {0}")]
    Stream(String),

    /// No factory registered for the requested backend type
    #[error("unsupported driver type: {0}")]
    UnsupportedType(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connect error
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    /// Create a fatal query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a retryable query error
    pub fn query_retryable(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a stream error
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    /// Whether the backend reported a transient condition
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Query { retryable: true, .. })
    }

    /// Stable discriminant for the wire `error.code` field
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "InvalidConfig",
            Self::Connect(_) => "ConnectError",
            Self::Query { retryable: true, .. } => "QueryError.retryable",
            Self::Query { .. } => "QueryError",
            Self::Stream(_) => "StreamError",
            Self::UnsupportedType(_) => "UnsupportedBackend",
        }
    }
}
