//! Common error types for tapeloop

use thiserror::Error;

/// Common result type for tapeloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by every tapeloop crate
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error came from the durable store itself.
    ///
    /// The orchestrator has no correct behaviour without its database, so
    /// callers treat these as process-fatal.
    pub fn is_database(&self) -> bool {
        matches!(self, Error::Database(_))
    }
}
