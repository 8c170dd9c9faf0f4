//! Server startup errors.

use thiserror::Error;

/// Failure to bring the listener up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bind or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
