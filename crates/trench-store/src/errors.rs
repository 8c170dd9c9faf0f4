//! Store error types.

use thiserror::Error;

/// Errors returned by a [`MessageStore`](crate::MessageStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Caller is not allowed to touch the entity.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Input rejected before touching storage.
    #[error("{0}")]
    InvalidInput(String),
    /// Underlying storage failed.
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
