//! Common error types for muvid

use thiserror::Error;

/// Common result type for muvid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across muvid services
#[derive(Error, Debug)]
pub enum Error {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
