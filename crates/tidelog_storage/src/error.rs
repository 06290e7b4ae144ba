//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Another handle holds the exclusive lock on the file.
    #[error("file is locked by another handle: {path}")]
    Locked {
        /// The locked file.
        path: std::path::PathBuf,
    },

    /// Attempted to write beyond the end of a mapped region.
    #[error("write beyond end of mapping: offset {offset}, len {len}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: usize,
        /// The requested write length.
        len: usize,
        /// The mapped size.
        size: usize,
    },
}
