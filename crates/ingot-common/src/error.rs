//! Error types shared across ingot crates

use thiserror::Error;

/// Result type alias for ingot operations
pub type Result<T> = std::result::Result<T, IngotError>;

/// Common error type for the non-domain parts of ingot
#[derive(Error, Debug)]
pub enum IngotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Logging error: {0}")]
    Logging(String),
}
