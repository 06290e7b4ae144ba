//! Error types for the log store.

use std::path::PathBuf;
use thiserror::Error;
use tidelog_format::{FormatError, HeaderMismatch};
use tidelog_storage::StorageError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding error.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Filesystem error outside the storage layer (rename, remove, list).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel configuration is unusable.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A file header failed validation.
    #[error("header of {path} rejected: {reason}")]
    HeaderRejected {
        /// The rejected file.
        path: PathBuf,
        /// What was wrong with it.
        reason: HeaderMismatch,
    },

    /// A file kept failing header validation after being recreated.
    #[error("{path} still invalid after {attempts} attempts")]
    ReloadExhausted {
        /// The file being loaded.
        path: PathBuf,
        /// Number of attempts made.
        attempts: usize,
    },

    /// A record did not fit even after rotating the cache file.
    #[error("record needs {needed} bytes but only {available} are free after rotation")]
    InsufficientSpace {
        /// Worst-case encoded size.
        needed: usize,
        /// Free bytes in the cache file.
        available: usize,
    },

    /// The write queue is at capacity.
    #[error("write queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The write queue no longer accepts tasks.
    #[error("write queue is not running")]
    QueueStopped,

    /// The cache file is not open and could not be reopened.
    #[error("cache file of channel '{channel}' is not open")]
    StoreUnavailable {
        /// Channel name.
        channel: String,
    },

    /// The channel was closed or destroyed.
    #[error("channel '{channel}' is closed")]
    ChannelClosed {
        /// Channel name.
        channel: String,
    },

    /// The registry has been shut down.
    #[error("registry has been shut down")]
    RegistryClosed,
}

impl CoreError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a store unavailable error.
    pub fn store_unavailable(channel: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            channel: channel.into(),
        }
    }

    /// Creates a channel closed error.
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }

    /// Returns `true` for back-pressure from the write queue.
    #[must_use]
    pub fn is_back_pressure(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::QueueStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::invalid_config("channel name is empty");
        assert_eq!(err.to_string(), "invalid configuration: channel name is empty");

        let err = CoreError::HeaderRejected {
            path: PathBuf::from("/tmp/a.log"),
            reason: HeaderMismatch::MagicMismatch,
        };
        assert!(err.to_string().contains("magic number mismatch"));
    }

    #[test]
    fn back_pressure_classification() {
        assert!(CoreError::QueueFull { capacity: 4 }.is_back_pressure());
        assert!(CoreError::QueueStopped.is_back_pressure());
        assert!(!CoreError::RegistryClosed.is_back_pressure());
    }

    #[test]
    fn error_from_format() {
        let err: CoreError = FormatError::EmptyRecord.into();
        assert!(matches!(err, CoreError::Format(FormatError::EmptyRecord)));
    }
}
