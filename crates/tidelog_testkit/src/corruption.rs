//! Controlled damage to archive and cache files.
//!
//! Record boundaries are located through sync markers, so these helpers
//! assume record payloads never contain the marker themselves.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use tidelog_format::{find_marker, header_len, SYNC_MARKER_LEN};

/// A mode byte no encoder produces.
pub const INVALID_MODE_BYTE: u8 = 0xFF;

/// Start offsets of the marker-terminated records in `bytes`, a file
/// written by `channel`. Zero fill after the last record is ignored.
pub fn record_offsets(bytes: &[u8], channel: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut pos = header_len(channel);
    while let Some(at) = find_marker(bytes, pos) {
        offsets.push(pos);
        pos = at + SYNC_MARKER_LEN;
    }
    offsets
}

/// Offset just past the `index`-th record's sync marker.
pub fn record_end(bytes: &[u8], channel: &str, index: usize) -> Option<usize> {
    let start = *record_offsets(bytes, channel).get(index)?;
    find_marker(bytes, start).map(|at| at + SYNC_MARKER_LEN)
}

/// Overwrites the byte at `offset`.
pub fn overwrite_byte(path: &Path, offset: usize, value: u8) -> io::Result<()> {
    let mut bytes = fs::read(path)?;
    let slot = bytes.get_mut(offset).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} is past the end of {}", path.display()),
        )
    })?;
    *slot = value;
    fs::write(path, bytes)
}

/// Replaces the mode byte of the `index`-th record with
/// [`INVALID_MODE_BYTE`].
pub fn corrupt_record_mode(path: &Path, channel: &str, index: usize) -> io::Result<()> {
    let bytes = fs::read(path)?;
    let offset = *record_offsets(&bytes, channel).get(index).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no record {index}", path.display()),
        )
    })?;
    overwrite_byte(path, offset, INVALID_MODE_BYTE)
}

/// Cuts `count` bytes off the end of the file, like a write torn by a
/// crash.
pub fn truncate_tail(path: &Path, count: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(count))
}

/// Breaks the header magic so the file no longer belongs to any channel.
pub fn corrupt_header(path: &Path) -> io::Result<()> {
    let bytes = fs::read(path)?;
    let first = bytes.first().copied().unwrap_or_default();
    overwrite_byte(path, 0, !first)
}
