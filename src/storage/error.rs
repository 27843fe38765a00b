//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Truncated or otherwise malformed on-disk buffer
    #[error("Invalid size: buffer too short")]
    InvalidSize,

    /// Data corruption detected (wrong magic trailer, bad block layout)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// `insert_rows` blocked past the configured write timeout
    #[error("Write overloaded: failed to enqueue rows within {0:?}")]
    WriteOverloaded(std::time::Duration),

    /// Segment file format error
    #[error("Invalid segment format: {0}")]
    InvalidSegment(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// The database is shutting down or already closed
    #[error("Database closed")]
    Closed,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
