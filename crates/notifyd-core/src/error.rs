//! Error taxonomy for store and domain operations.
//!
//! Maps low-level sqlx failures into the handful of conditions callers
//! actually branch on: duplicates (idempotency collisions), absent rows,
//! bad input, and everything else as an opaque database failure.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error type for store and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Unique constraint collision, e.g. `(partner_id, idempotency_key)`.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Entity not found where the caller required one.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input violated a domain invariant.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Duplicate(format!("unique constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl CoreError {
    /// Whether this error is an idempotency-key collision the caller can
    /// recover from by re-reading the existing row.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}
