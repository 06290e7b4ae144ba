//! Storage backend trait definition.

use crate::error::StorageResult;

/// A read-only byte source.
///
/// Archive files are immutable once rotated out, so the decoding side only
/// ever needs positional reads and the total length. Backends do not
/// interpret the bytes they hold.
///
/// # Implementors
///
/// - [`super::FileBackend`] - Files on disk
/// - [`super::InMemoryBackend`] - For testing
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StorageBackend::read_at`].
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let data = self.read_at(offset, buf.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Returns the size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
