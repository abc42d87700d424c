//! Unified error type and structural error taxonomy.
//!
//! Every failure that can reach a retry decision is tagged with an
//! [`ErrorKind`] where it is produced (store, generation client, broker),
//! so callers classify by variant and never by message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structural classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset or unreachable.
    Connection,
    /// The operation did not complete in time.
    Timeout,
    /// The downstream service asked us to slow down (HTTP 429).
    RateLimited,
    /// The downstream service failed (HTTP 5xx).
    Unavailable,
    /// A circuit breaker rejected the call without invoking it.
    CircuitOpen,
    /// The referenced record does not exist.
    NotFound,
    /// The input is empty, malformed or rejected as invalid.
    InvalidInput,
    /// Credentials were rejected.
    Unauthorized,
    /// The worker is misconfigured.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns true if an operation failing with this kind may succeed when retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::RateLimited | Self::Unavailable | Self::CircuitOpen
        )
    }

    /// Returns a stable machine-readable label, used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::CircuitOpen => "circuit_open",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that carry a structural [`ErrorKind`].
pub trait Classify {
    /// Returns the kind of this error.
    fn kind(&self) -> ErrorKind;

    /// Returns true if the failed operation may succeed when retried.
    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl Classify for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

/// Unified error type for the store, generation and configuration layers.
#[derive(Error, Debug)]
pub enum GraphvecError {
    /// Record not found.
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// Input rejected as empty or invalid.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Could not reach a dependency.
    #[error("Connection to {service} failed: {message}")]
    Connection {
        service: &'static str,
        message: String,
    },

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Downstream rate limit hit.
    #[error("Rate limit exceeded by {service}: {message}")]
    RateLimited { service: String, message: String },

    /// Downstream server error.
    #[error("External service error: {service} returned {status} - {message}")]
    Unavailable {
        service: String,
        status: u16,
        message: String,
    },

    /// Credentials rejected by a downstream service.
    #[error("Unauthorized by {service}: {message}")]
    Unauthorized { service: String, message: String },

    /// Circuit breaker open.
    #[error("Circuit '{name}' open, retry after {}s", retry_after.as_secs())]
    CircuitBreakerOpen { name: String, retry_after: Duration },

    /// Database error that is not a connectivity problem.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GraphvecError {
    /// Creates a not found error for a resource.
    #[must_use]
    pub fn not_found<T: ToString>(resource_type: &'static str, id: T) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates an invalid input error.
    #[must_use]
    pub fn invalid_input<T: Into<String>>(message: T) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Creates a connection error for the named dependency.
    #[must_use]
    pub fn connection<T: Into<String>>(service: &'static str, message: T) -> Self {
        Self::Connection {
            service,
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }
}

impl Classify for GraphvecError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::CircuitBreakerOpen { .. } => ErrorKind::CircuitOpen,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Database(_) | Self::Internal(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for GraphvecError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound {
                resource_type: "record",
                id: "unknown".to_string(),
            },
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                Self::connection("store", err.to_string())
            }
            sqlx::Error::PoolTimedOut => Self::Timeout(format!("store: {err}")),
            sqlx::Error::Database(db_err) => {
                // SQLSTATE class 08 is connection exception; 57P0x is server shutdown
                match db_err.code().as_deref() {
                    Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                        Self::connection("store", db_err.message().to_string())
                    }
                    Some("57014") => Self::Timeout(format!("store: {}", db_err.message())),
                    _ => Self::Database(err.to_string()),
                }
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for GraphvecError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("JSON serialization error: {err}"))
    }
}
