//! File header encoding and validation.

use crate::error::{FormatError, FormatResult};
use crate::marker::{SYNC_MARKER, SYNC_MARKER_LEN};
use thiserror::Error;

/// Magic number at offset 0 of every cache and archive file.
pub const MAGIC: [u8; 4] = [0x1B, 0xAD, 0xC0, 0xDE];

/// The only format version this crate reads and writes.
pub const FORMAT_VERSION: u8 = 4;

/// Magic, version and name-length field.
pub const HEADER_PREFIX_LEN: usize = MAGIC.len() + 1 + 2;

/// Why a header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderMismatch {
    /// The file is shorter than the expected header.
    #[error("file is smaller than the header")]
    SizeTooSmall,
    /// The header bytes could not be read.
    #[error("header could not be read")]
    ReadFail,
    /// The magic number is wrong.
    #[error("magic number mismatch")]
    MagicMismatch,
    /// The version byte is not [`FORMAT_VERSION`].
    #[error("unsupported format version {0}")]
    VersionMismatch(u8),
    /// The file belongs to a different channel.
    #[error("channel name mismatch")]
    ChannelMismatch,
    /// The marker closing the header is damaged.
    #[error("header sync marker mismatch")]
    SyncMarkerMismatch,
}

/// Returns the header length for `channel`.
#[must_use]
pub fn header_len(channel: &str) -> usize {
    HEADER_PREFIX_LEN + channel.len() + SYNC_MARKER_LEN
}

/// Encodes the header for `channel`.
///
/// # Errors
///
/// Returns [`FormatError::ChannelNameTooLong`] if the name does not fit in
/// the 2-byte length field.
pub fn encode_header(channel: &str) -> FormatResult<Vec<u8>> {
    let name_len = u16::try_from(channel.len())
        .map_err(|_| FormatError::ChannelNameTooLong { len: channel.len() })?;

    let mut out = Vec::with_capacity(header_len(channel));
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(channel.as_bytes());
    out.extend_from_slice(&SYNC_MARKER);
    Ok(out)
}

/// Validates the header at the start of `bytes` against `channel`.
///
/// `bytes` only needs to hold the header itself; anything after it is
/// ignored. Returns the header length on success.
///
/// # Errors
///
/// Returns the first [`HeaderMismatch`] found, checking in file order.
pub fn parse_header(bytes: &[u8], channel: &str) -> Result<usize, HeaderMismatch> {
    if bytes.len() < HEADER_PREFIX_LEN {
        return Err(HeaderMismatch::SizeTooSmall);
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(HeaderMismatch::MagicMismatch);
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(HeaderMismatch::VersionMismatch(version));
    }

    let name_len = u16::from_le_bytes([bytes[MAGIC.len() + 1], bytes[MAGIC.len() + 2]]) as usize;
    if name_len != channel.len() {
        return Err(HeaderMismatch::ChannelMismatch);
    }

    let total = header_len(channel);
    if bytes.len() < total {
        return Err(HeaderMismatch::SizeTooSmall);
    }
    let name_end = HEADER_PREFIX_LEN + name_len;
    if &bytes[HEADER_PREFIX_LEN..name_end] != channel.as_bytes() {
        return Err(HeaderMismatch::ChannelMismatch);
    }
    if bytes[name_end..total] != SYNC_MARKER {
        return Err(HeaderMismatch::SyncMarkerMismatch);
    }
    Ok(total)
}
