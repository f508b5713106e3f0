//! Error types for codevec
//!
//! This module provides the error taxonomy shared by the metadata store,
//! the vector index and the search layer.

use thiserror::Error;

/// Main error type for codevec operations
#[derive(Error, Debug)]
pub enum CodevecError {
    /// Malformed input: parallel array length mismatch, bad offsets,
    /// vector dimension mismatch. Raised before anything is written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The vector index is full and could not be grown
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Metadata rows and index entries disagree
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// An index operation was attempted before a dimension was bound
    #[error("No vector index is bound to a dimension")]
    IndexNotBound,

    /// Transaction misuse (e.g. a foreign transaction already open)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The metadata store could not be opened or is unavailable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Index snapshot encode/decode failures
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(String),
}

impl CodevecError {
    pub fn is_validation(&self) -> bool {
        matches!(self, CodevecError::Validation(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, CodevecError::Capacity(_))
    }
}

/// Result type alias for codevec operations
pub type Result<T> = std::result::Result<T, CodevecError>;

impl From<bincode::Error> for CodevecError {
    fn from(err: bincode::Error) -> Self {
        CodevecError::Snapshot(err.to_string())
    }
}
