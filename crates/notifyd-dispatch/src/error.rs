//! Error types and outcome classification for delivery operations.
//!
//! `DispatchError` covers everything between "the worker decided to send"
//! and "the attempt row is written": transport failures, timeouts,
//! non-success statuses, and store errors encountered along the way. The
//! journal tag for each failure comes from [`DispatchError::error_code`].

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error conditions during a delivery attempt.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Transport-level failure: DNS, connect, TLS, or mid-stream error.
    #[error("request failed: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
    },

    /// The per-request deadline elapsed before a response arrived.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// The deadline that was exceeded, in seconds.
        timeout_seconds: u64,
    },

    /// A response arrived but its status classified as failure.
    #[error("unexpected status: HTTP {status_code}")]
    Status {
        /// The response code.
        status_code: u16,
    },

    /// Store operation failed while recording the outcome.
    #[error("database error: {message}")]
    Database {
        /// Description of the store failure.
        message: String,
    },

    /// Invalid client or task configuration (e.g. unparseable URL).
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Workers failed to drain before the shutdown deadline.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The drain deadline that was exceeded.
        timeout: std::time::Duration,
    },
}

impl DispatchError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a failure-status error.
    pub fn status(status_code: u16) -> Self {
        Self::Status { status_code }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// The symbolic tag journaled with a failed attempt.
    pub fn error_code(&self) -> String {
        match self {
            Self::Timeout { .. } => "HTTP_REQUEST_TIMEOUT".to_string(),
            Self::Status { status_code } => format!("HTTP_STATUS_{status_code}"),
            Self::Network { .. }
            | Self::Database { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. } => "HTTP_REQUEST_FAILED".to_string(),
        }
    }
}

impl From<notifyd_core::CoreError> for DispatchError {
    fn from(err: notifyd_core::CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}

/// Default success rule for a response code.
///
/// `200 <= c < 400` is success. 429 is an explicit failure retried with
/// normal backoff. Everything else fails.
pub fn classify_status(status_code: u16) -> bool {
    (200..400).contains(&status_code)
}
