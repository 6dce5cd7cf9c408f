//! Error types for worklens-core

use thiserror::Error;

/// Main error type for the worklens-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (the only fatal class; everything else degrades)
    #[error("configuration error: {0}")]
    Config(String),

    /// Inference service error (timeout, quota, malformed response)
    #[error("inference error: {0}")]
    Inference(String),
}

/// Result type alias for worklens-core
pub type Result<T> = std::result::Result<T, Error>;
