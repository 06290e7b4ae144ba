//! Channel and maintenance configuration.

use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;
use std::time::Duration;
use tidelog_format::{
    compressor_for, envelope_len, header_len, CompressMode, EncryptMode, PeerPublicKey,
    MAX_RECORD_LEN,
};
use tidelog_storage::{page_size, round_up_to_page};

/// Default archive expiry: 7 days.
pub const DEFAULT_EXPIRE_SECS: u64 = 7 * 24 * 60 * 60;
/// Default limit on the total size of a channel's archives: 16 MiB.
pub const DEFAULT_TOTAL_ARCHIVE_SIZE_LIMIT: u64 = 16 * 1024 * 1024;
/// Default limit on the number of archives per channel.
pub const DEFAULT_MAX_ARCHIVE_COUNT: usize = 30;
/// Default cache file size, in pages.
pub const DEFAULT_CACHE_PAGES: usize = 32;
/// Default write queue capacity, in tasks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 16;
/// Default time a blocking flush waits for the write queue.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Configuration for one channel.
///
/// Only `name` and `root_dir` are required; everything else has a default.
/// The configuration is fixed once the channel is created, except for the
/// expiry which can be lowered later through
/// [`crate::Channel::reset_expire_secs`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel name. Unique per registry; also the file name prefix.
    pub name: String,

    /// Directory holding the cache file and archives. Created if missing.
    pub root_dir: PathBuf,

    /// Append rotations into one file per day instead of one file per
    /// rotation.
    pub incremental_archive: bool,

    /// Route writes through a dedicated worker thread.
    pub async_write: bool,

    /// Archives older than this are removed by retention.
    pub expire_secs: u64,

    /// Retention keeps the total archive size under this many bytes.
    pub total_archive_size_limit: u64,

    /// Retention keeps at most this many archives.
    pub max_archive_count: usize,

    /// Payload compression.
    pub compress_mode: CompressMode,

    /// Payload encryption.
    pub encrypt_mode: EncryptMode,

    /// Hex-encoded X25519 public key. Required with [`EncryptMode::Aes`].
    pub peer_public_key: Option<String>,

    /// Cache file size in pages.
    pub cache_pages: usize,

    /// Maximum number of queued tasks for async channels.
    pub queue_capacity: usize,

    /// How long blocking flushes wait for the write queue.
    pub flush_timeout: Duration,
}

impl ChannelConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new(name: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root_dir: root_dir.into(),
            incremental_archive: false,
            async_write: true,
            expire_secs: DEFAULT_EXPIRE_SECS,
            total_archive_size_limit: DEFAULT_TOTAL_ARCHIVE_SIZE_LIMIT,
            max_archive_count: DEFAULT_MAX_ARCHIVE_COUNT,
            compress_mode: CompressMode::Zlib,
            encrypt_mode: EncryptMode::None,
            peer_public_key: None,
            cache_pages: DEFAULT_CACHE_PAGES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    /// Sets incremental (per-day) archiving.
    #[must_use]
    pub const fn incremental_archive(mut self, value: bool) -> Self {
        self.incremental_archive = value;
        self
    }

    /// Sets asynchronous writes.
    #[must_use]
    pub const fn async_write(mut self, value: bool) -> Self {
        self.async_write = value;
        self
    }

    /// Sets the archive expiry in seconds.
    #[must_use]
    pub const fn expire_secs(mut self, secs: u64) -> Self {
        self.expire_secs = secs;
        self
    }

    /// Sets the total archive size limit in bytes.
    #[must_use]
    pub const fn total_archive_size_limit(mut self, bytes: u64) -> Self {
        self.total_archive_size_limit = bytes;
        self
    }

    /// Sets the maximum number of archives.
    #[must_use]
    pub const fn max_archive_count(mut self, count: usize) -> Self {
        self.max_archive_count = count;
        self
    }

    /// Sets the compression mode.
    #[must_use]
    pub const fn compress_mode(mut self, mode: CompressMode) -> Self {
        self.compress_mode = mode;
        self
    }

    /// Enables AES encryption towards the given hex-encoded public key.
    #[must_use]
    pub fn encrypt_with(mut self, peer_public_key: impl Into<String>) -> Self {
        self.encrypt_mode = EncryptMode::Aes;
        self.peer_public_key = Some(peer_public_key.into());
        self
    }

    /// Sets the cache file size in pages.
    #[must_use]
    pub const fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Sets the write queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets how long blocking flushes wait.
    #[must_use]
    pub const fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Cache file size in bytes.
    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        round_up_to_page(self.cache_pages.saturating_mul(page_size()))
    }

    /// Checks the configuration and parses the key material.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for an empty or path-like name,
    /// an empty root directory, zero limits, a cache too small for one
    /// maximum-size record, or missing/malformed key material.
    pub fn validate(&self) -> CoreResult<Option<PeerPublicKey>> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_config("channel name is empty"));
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(CoreError::invalid_config(format!(
                "channel name '{}' is not a valid file name",
                self.name
            )));
        }
        if u16::try_from(self.name.len()).is_err() {
            return Err(CoreError::invalid_config("channel name is too long"));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(CoreError::invalid_config("root directory is empty"));
        }
        if self.max_archive_count == 0 {
            return Err(CoreError::invalid_config("max archive count must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::invalid_config("queue capacity must be positive"));
        }

        let encrypted = self.encrypt_mode == EncryptMode::Aes;
        let largest = envelope_len(
            compressor_for(self.compress_mode).max_output_len(MAX_RECORD_LEN),
            encrypted,
        );
        let needed = header_len(&self.name) + largest;
        if self.cache_capacity() < needed {
            return Err(CoreError::invalid_config(format!(
                "cache of {} bytes cannot hold a {needed}-byte record",
                self.cache_capacity()
            )));
        }

        if !encrypted {
            return Ok(None);
        }
        let Some(hex) = self.peer_public_key.as_deref() else {
            return Err(CoreError::invalid_config(
                "encryption requested without a peer public key",
            ));
        };
        PeerPublicKey::from_hex(hex)
            .map(Some)
            .map_err(|e| CoreError::invalid_config(e.to_string()))
    }
}

/// When [`crate::Channel::archive_snapshot`] should rotate the cache first.
///
/// With `flush` set and both thresholds at zero the rotation is
/// unconditional; a non-zero threshold makes it conditional on that
/// threshold being reached (either one suffices).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveCondition {
    /// Rotate at all.
    pub flush: bool,
    /// Minimum number of pending records.
    pub min_record_count: usize,
    /// Minimum number of pending stored payload bytes.
    pub min_total_bytes: usize,
}

impl Default for ArchiveCondition {
    fn default() -> Self {
        Self::flush()
    }
}

impl ArchiveCondition {
    /// Always rotate.
    #[must_use]
    pub const fn flush() -> Self {
        Self {
            flush: true,
            min_record_count: 0,
            min_total_bytes: 0,
        }
    }

    /// Never rotate; only list.
    #[must_use]
    pub const fn skip_flush() -> Self {
        Self {
            flush: false,
            min_record_count: 0,
            min_total_bytes: 0,
        }
    }

    /// Sets the pending-record threshold.
    #[must_use]
    pub const fn min_record_count(mut self, count: usize) -> Self {
        self.min_record_count = count;
        self
    }

    /// Sets the pending-bytes threshold.
    #[must_use]
    pub const fn min_total_bytes(mut self, bytes: usize) -> Self {
        self.min_total_bytes = bytes;
        self
    }

    /// Whether pending counters of `records` / `bytes` warrant a rotation.
    #[must_use]
    pub const fn is_met(&self, records: usize, bytes: usize) -> bool {
        if !self.flush {
            return false;
        }
        if self.min_record_count == 0 && self.min_total_bytes == 0 {
            return true;
        }
        (self.min_record_count > 0 && records >= self.min_record_count)
            || (self.min_total_bytes > 0 && bytes >= self.min_total_bytes)
    }
}

/// Ordering of archive listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOrder {
    /// Directory order.
    #[default]
    None,
    /// Oldest first.
    CreateTimeAscending,
    /// Newest first.
    CreateTimeDescending,
}

/// Schedule of the maintenance daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Delay before the first tick.
    pub initial_delay: Duration,
    /// Delay between later ticks.
    pub interval: Duration,
    /// Window on either side of local midnight in which day-boundary flushes
    /// are armed.
    pub midnight_tolerance: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            interval: Duration::from_secs(120),
            midnight_tolerance: Duration::from_secs(150),
        }
    }
}

impl DaemonConfig {
    /// Sets the delay before the first tick.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the tick interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}
