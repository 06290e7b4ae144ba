//! Per-channel counters.
//!
//! All counters are atomic and can be read while writes are in progress.
//! Values only ever increase.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Records appended to the cache file.
    records_written: AtomicU64,
    /// Caller bytes of those records, before compression.
    bytes_written: AtomicU64,
    /// Writes that failed after being accepted.
    write_failures: AtomicU64,
    /// Writes refused by the queue (full or stopped).
    queue_rejections: AtomicU64,
    /// Cache rotations into archives.
    rotations: AtomicU64,
    /// Archives removed by retention or explicit removal.
    archives_removed: AtomicU64,
}

impl ChannelStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removals(&self, count: usize) {
        self.archives_removed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Returns the number of records written.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Returns the uncompressed bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the number of failed writes.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of writes refused by the queue.
    pub fn queue_rejections(&self) -> u64 {
        self.queue_rejections.load(Ordering::Relaxed)
    }

    /// Returns the number of rotations.
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Returns the number of archives removed.
    pub fn archives_removed(&self) -> u64 {
        self.archives_removed.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_written: self.records_written(),
            bytes_written: self.bytes_written(),
            write_failures: self.write_failures(),
            queue_rejections: self.queue_rejections(),
            rotations: self.rotations(),
            archives_removed: self.archives_removed(),
        }
    }
}

/// A point-in-time copy of [`ChannelStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Records written.
    pub records_written: u64,
    /// Uncompressed bytes written.
    pub bytes_written: u64,
    /// Failed writes.
    pub write_failures: u64,
    /// Writes refused by the queue.
    pub queue_rejections: u64,
    /// Rotations.
    pub rotations: u64,
    /// Archives removed.
    pub archives_removed: u64,
}
