//! Memory-mapped files.
//!
//! Mapping a file is the only `unsafe` operation in the workspace. The
//! mappings created here are private to one owner at a time: the cache file
//! is guarded by its store's lock, and tail maps live only for the duration
//! of a single copy.

#![allow(unsafe_code)]

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Returns the system page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

/// Rounds `len` up to the next multiple of the page size (minimum one page).
#[must_use]
pub fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    len.max(1).div_ceil(page) * page
}

/// A writable, fixed-size memory map over a whole file.
///
/// The file is resized to a page multiple and its blocks are reserved up
/// front, so a full disk shows up as an error from [`MappedFile::open`]
/// rather than a fault on a later store into the map. The file is locked
/// exclusively for as long as the `MappedFile` lives.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl MappedFile {
    /// Opens or creates `path` and maps `len` bytes of it, rounded up to the
    /// page size.
    ///
    /// An existing file of a different length is resized; bytes beyond the
    /// old length read as zero.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle already maps the
    /// file, or an I/O error if it cannot be opened, resized, reserved or
    /// mapped.
    pub fn open(path: &Path, len: usize) -> StorageResult<Self> {
        let len = round_up_to_page(len);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.to_path_buf(),
            });
        }

        let current = file.metadata()?.len();
        if current != len as u64 {
            file.set_len(len as u64)?;
        }
        if current < len as u64 {
            file.allocate(len as u64)?;
        }

        // SAFETY: the file was opened read-write by us and is only modified
        // through this mapping while it exists.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
        })
    }

    /// Returns the path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Copies `data` into the map at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WritePastEnd`] if the data does not fit.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> StorageResult<()> {
        let size = self.map.len();
        let end = offset.checked_add(data.len()).filter(|end| *end <= size);
        let Some(end) = end else {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        };
        self.map[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Synchronously writes dirty pages back to the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the msync call fails.
    pub fn flush(&self) -> StorageResult<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Unmaps the file and truncates it to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized or synced.
    pub fn unmap_and_truncate(self, len: u64) -> StorageResult<()> {
        let Self { file, map, .. } = self;
        drop(map);
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Appends `data` to the end of an existing file through a memory map of
/// just the affected pages.
///
/// The file is grown to cover the page-aligned window containing the tail,
/// the window is mapped, filled and synced, and the file is finally trimmed
/// back to its exact new length. Returns the offset the data was written at.
///
/// # Errors
///
/// Returns an error if any resize, reserve, map or sync step fails. The file
/// length is only trimmed on success, so a failed append can leave zero
/// padding after the old end of the file.
pub fn append_mapped(path: &Path, data: &[u8]) -> StorageResult<u64> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let offset = file.metadata()?.len();
    if data.is_empty() {
        return Ok(offset);
    }

    let page = page_size() as u64;
    let window_start = offset / page * page;
    let delta = (offset - window_start) as usize;
    let window_len = round_up_to_page(delta + data.len());
    let window_end = window_start + window_len as u64;

    file.set_len(window_end)?;
    file.allocate(window_end)?;

    // SAFETY: the window lies inside the file we just resized, and the map is
    // dropped before the file is trimmed below.
    let mut map = unsafe {
        MmapOptions::new()
            .offset(window_start)
            .len(window_len)
            .map_mut(&file)?
    };
    map[delta..delta + data.len()].copy_from_slice(data);
    map.flush()?;
    drop(map);

    file.set_len(offset + data.len() as u64)?;
    file.sync_all()?;
    Ok(offset)
}
