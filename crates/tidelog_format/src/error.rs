//! Error types for encoding and transforming records.

use thiserror::Error;

/// Result type for format operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Errors raised while building headers or encoding records.
///
/// Problems found while *decoding* are not errors of this type; they are
/// reported as [`crate::EnvelopeError`] / [`crate::DecodeError`] so callers
/// can recover and keep going.
#[derive(Debug, Error)]
pub enum FormatError {
    /// A zero-length record was submitted.
    #[error("record is empty")]
    EmptyRecord,

    /// A record exceeds the maximum length.
    #[error("record too large: {len} bytes (max {max})")]
    RecordTooLarge {
        /// Actual length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The channel name does not fit the 2-byte length field.
    #[error("channel name too long: {len} bytes")]
    ChannelNameTooLong {
        /// Name length in bytes.
        len: usize,
    },

    /// The compressor failed.
    #[error("compression failed: {0}")]
    Compress(String),

    /// The decompressor failed.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Key material could not be parsed or used.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation or cipher setup failed.
    #[error("cipher error: {0}")]
    Cipher(String),
}
