//! The memory-mapped cache file of a channel.
//!
//! A [`LogStore`] owns one page-multiple [`MappedFile`] laid out as
//! `header | records | zero fill`. The logical write position only moves
//! forward; it is reset solely when the file is rotated into an archive and
//! recreated.

use crate::error::{CoreError, CoreResult};
use crate::reader::read_header;
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tidelog_format::{
    compressor_for, encode_header, envelope_len, parse_header, scan_records, validate_record,
    CompressMode, HeaderMismatch, PeerPublicKey, RecordEncoder, SessionCipher,
};
use tidelog_storage::{append_mapped, FileBackend, MappedFile};
use tracing::{debug, error, warn};

/// How many times a rejected file is deleted and recreated before giving up.
pub const MAX_LOAD_ATTEMPTS: usize = 5;

/// Result of [`LogStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AppendOutcome {
    /// The record is in the cache file.
    Written,
    /// The record might not fit; rotate the cache file and retry.
    NeedsRotation,
}

/// Parameters of a [`LogStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Channel name written into the header.
    pub channel: String,
    /// Path of the cache file.
    pub path: PathBuf,
    /// Mapped size in bytes; rounded up to whole pages.
    pub capacity: usize,
    /// Compression applied to every record.
    pub compress: CompressMode,
    /// Peer key for encryption, if enabled.
    pub peer: Option<PeerPublicKey>,
}

enum LoadError {
    Rejected(HeaderMismatch),
    Failed(CoreError),
}

impl From<CoreError> for LoadError {
    fn from(err: CoreError) -> Self {
        Self::Failed(err)
    }
}

impl From<tidelog_storage::StorageError> for LoadError {
    fn from(err: tidelog_storage::StorageError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<tidelog_format::FormatError> for LoadError {
    fn from(err: tidelog_format::FormatError) -> Self {
        Self::Failed(err.into())
    }
}

/// The cache file currently accepting records for one channel.
pub struct LogStore {
    options: StoreOptions,
    file: Option<MappedFile>,
    header_len: usize,
    position: usize,
    record_count: usize,
    payload_bytes: usize,
    created_at: DateTime<Local>,
    encoder: RecordEncoder,
}

impl LogStore {
    /// Opens or creates the cache file.
    ///
    /// An existing file with a valid header is replayed to find the write
    /// position; an invalid one is deleted and recreated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be mapped or keeps failing
    /// validation.
    pub fn open(options: StoreOptions) -> CoreResult<Self> {
        let encoder = RecordEncoder::new(compressor_for(options.compress), None);
        let mut store = Self {
            options,
            file: None,
            header_len: 0,
            position: 0,
            record_count: 0,
            payload_bytes: 0,
            created_at: Local::now(),
            encoder,
        };
        store.load()?;
        Ok(store)
    }

    /// Path of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.options.path
    }

    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.options.channel
    }

    /// Mapped size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.file
            .as_ref()
            .map_or(self.options.capacity, MappedFile::len)
    }

    /// Whether the file is currently mapped.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Offset the next record will be written at.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Length of the header.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Records currently in the file.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Stored payload bytes currently in the file.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Bytes left before the end of the mapping.
    #[must_use]
    pub fn space_left(&self) -> usize {
        self.capacity().saturating_sub(self.position)
    }

    /// When the current cache file was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// Worst-case bytes needed to store a record of `len` bytes.
    #[must_use]
    pub fn max_encoded_len(&self, len: usize) -> usize {
        self.encoder.max_encoded_len(len)
    }

    /// Encodes `record` into the cache file.
    ///
    /// Reopens the file first if an earlier failure closed it. Returns
    /// [`AppendOutcome::NeedsRotation`] without touching the file when the
    /// worst-case encoding would not fit.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty or oversized record, or if the file
    /// cannot be reopened. A failure while encoding closes the file.
    pub fn append(&mut self, record: &[u8]) -> CoreResult<AppendOutcome> {
        validate_record(record)?;
        self.ensure_open()?;

        if self.encoder.max_encoded_len(record.len()) > self.space_left() {
            return Ok(AppendOutcome::NeedsRotation);
        }

        let encoded = match self.encoder.encode(record) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(channel = %self.options.channel, error = %err, "fail to encode record");
                self.close();
                return Err(err.into());
            }
        };
        let Some(file) = self.file.as_mut() else {
            return Err(CoreError::store_unavailable(&self.options.channel));
        };
        if let Err(err) = file.write_at(self.position, &encoded) {
            error!(channel = %self.options.channel, position = self.position, error = %err, "fail to write record");
            self.close();
            return Err(err.into());
        }

        let overhead = envelope_len(0, self.encoder.mode().is_encrypted());
        self.position += encoded.len();
        self.record_count += 1;
        self.payload_bytes += encoded.len() - overhead;
        Ok(AppendOutcome::Written)
    }

    /// Writes dirty pages back to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is closed or msync fails.
    pub fn sync(&self) -> CoreResult<()> {
        let Some(file) = self.file.as_ref() else {
            return Err(CoreError::store_unavailable(&self.options.channel));
        };
        file.flush()?;
        Ok(())
    }

    /// Turns the cache file into the standalone archive `dest` and starts a
    /// new cache file.
    ///
    /// The file is truncated to its logical length before the rename.
    ///
    /// # Errors
    ///
    /// Returns an error if any sync, truncate, rename or reload step fails.
    /// The store is left closed in that case.
    pub fn archive_to(&mut self, dest: &Path) -> CoreResult<()> {
        let Some(file) = self.file.take() else {
            return Err(CoreError::store_unavailable(&self.options.channel));
        };
        file.flush()?;
        file.unmap_and_truncate(self.position as u64)?;

        match fs::remove_file(dest) {
            Ok(()) => warn!(path = %dest.display(), "replaced existing archive"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::rename(&self.options.path, dest)?;
        debug!(
            channel = %self.options.channel,
            archive = %dest.display(),
            records = self.record_count,
            "cache archived"
        );

        self.reset_counters();
        self.load()
    }

    /// Appends the records of the cache file to the day archive `dest`,
    /// creating it with a header first if needed, then recreates the cache
    /// file.
    ///
    /// A day archive with an invalid header is deleted and started over.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The store is left closed and the
    /// cache file stays on disk, so its records are replayed by the next
    /// load.
    pub fn append_to(&mut self, dest: &Path) -> CoreResult<()> {
        let Some(file) = self.file.as_ref() else {
            return Err(CoreError::store_unavailable(&self.options.channel));
        };
        let result = file.flush().map_err(CoreError::from).and_then(|()| {
            let bytes = file.as_slice();
            let needs_header = prepare_day_file(dest, &self.options.channel)?;
            let mut data = Vec::with_capacity(self.position);
            if needs_header {
                data.extend_from_slice(&bytes[..self.header_len]);
            }
            data.extend_from_slice(&bytes[self.header_len..self.position]);
            append_mapped(dest, &data)?;
            Ok(())
        });
        if let Err(err) = result {
            error!(channel = %self.options.channel, archive = %dest.display(), error = %err, "fail to append cache to archive");
            self.close();
            return Err(err);
        }
        debug!(
            channel = %self.options.channel,
            archive = %dest.display(),
            records = self.record_count,
            "cache appended"
        );
        self.recreate()
    }

    /// Discards the cache file and starts an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the old file cannot be removed or the new one
    /// cannot be created.
    pub fn recreate(&mut self) -> CoreResult<()> {
        self.file = None;
        remove_if_exists(&self.options.path)?;
        self.reset_counters();
        self.load()
    }

    /// Flushes and unmaps the file. The next append reopens it.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.flush() {
                warn!(path = %self.options.path.display(), error = %err, "fail to sync cache on close");
            }
        }
    }

    fn ensure_open(&mut self) -> CoreResult<()> {
        if self.file.is_none() {
            debug!(channel = %self.options.channel, "reopening closed cache file");
            self.reset_counters();
            self.load()?;
        }
        Ok(())
    }

    fn reset_counters(&mut self) {
        self.header_len = 0;
        self.position = 0;
        self.record_count = 0;
        self.payload_bytes = 0;
    }

    fn load(&mut self) -> CoreResult<()> {
        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            match self.try_load() {
                Ok(()) => return Ok(()),
                Err(LoadError::Rejected(reason)) => {
                    warn!(
                        path = %self.options.path.display(),
                        %reason,
                        attempt,
                        "cache header mismatch, recreating"
                    );
                    remove_if_exists(&self.options.path)?;
                }
                Err(LoadError::Failed(err)) => {
                    error!(path = %self.options.path.display(), error = %err, "fail to load cache");
                    return Err(err);
                }
            }
        }
        Err(CoreError::ReloadExhausted {
            path: self.options.path.clone(),
            attempts: MAX_LOAD_ATTEMPTS,
        })
    }

    fn try_load(&mut self) -> Result<(), LoadError> {
        let existing = match fs::metadata(&self.options.path) {
            Ok(meta) if meta.len() > 0 => Some(meta),
            Ok(_) => None,
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(CoreError::from(err).into()),
        };

        let mut file = MappedFile::open(&self.options.path, self.options.capacity)?;
        let (header_len, position, records, bytes) = match &existing {
            Some(_) => {
                let header_len = parse_header(file.as_slice(), &self.options.channel)
                    .map_err(LoadError::Rejected)?;
                let summary = scan_records(file.as_slice(), header_len);
                if summary.skipped > 0 {
                    warn!(
                        path = %self.options.path.display(),
                        skipped = summary.skipped,
                        "skipped damaged records in cache"
                    );
                }
                (header_len, summary.end, summary.records, summary.payload_bytes)
            }
            None => {
                let header = encode_header(&self.options.channel)?;
                file.write_at(0, &header)?;
                file.flush()?;
                (header.len(), header.len(), 0, 0)
            }
        };

        let cipher = match &self.options.peer {
            Some(peer) => Some(SessionCipher::establish(peer)?),
            None => None,
        };
        self.encoder.reset(cipher);

        self.created_at = existing
            .and_then(|meta| meta.created().or_else(|_| meta.modified()).ok())
            .map_or_else(Local::now, |time: SystemTime| DateTime::<Local>::from(time));
        self.header_len = header_len;
        self.position = position;
        self.record_count = records;
        self.payload_bytes = bytes;
        self.file = Some(file);
        debug!(
            path = %self.options.path.display(),
            position,
            records,
            "cache loaded"
        );
        Ok(())
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("path", &self.options.path)
            .field("open", &self.file.is_some())
            .field("position", &self.position)
            .field("records", &self.record_count)
            .finish()
    }
}

/// Makes sure `path` is absent or a day archive with a valid header.
/// Returns `true` if the caller must write a header first.
fn prepare_day_file(path: &Path, channel: &str) -> CoreResult<bool> {
    for attempt in 1..=MAX_LOAD_ATTEMPTS {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if size == 0 {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            return Ok(true);
        }

        let backend = FileBackend::open_read_only(path)?;
        match read_header(&backend, channel) {
            Ok(_) => return Ok(false),
            Err(reason) => {
                drop(backend);
                warn!(path = %path.display(), %reason, attempt, "day archive header mismatch, recreating");
                remove_if_exists(path)?;
            }
        }
    }
    Err(CoreError::ReloadExhausted {
        path: path.to_path_buf(),
        attempts: MAX_LOAD_ATTEMPTS,
    })
}

fn remove_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
