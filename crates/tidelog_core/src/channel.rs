//! A named log channel: one cache file, its archives and their retention.
//!
//! A [`Channel`] routes every mutating operation either straight to its
//! [`LogStore`] under a lock (synchronous channels) or onto its
//! [`WriteQueue`] (asynchronous channels). Because the queue has a single
//! worker, a flush submitted after N writes always sees all N.

use crate::archive::{
    collect_archives, plan_cleanup, remove_planned, CleanupReport, RetentionPolicy,
};
use crate::config::{ArchiveCondition, ChannelConfig, FileOrder};
use crate::error::{CoreError, CoreResult};
use crate::naming::{cache_path, day_archive_path, standalone_archive_path};
use crate::queue::WriteQueue;
use crate::reader::LogReader;
use crate::stats::ChannelStats;
use crate::store::{AppendOutcome, LogStore, StoreOptions};
use crate::sync::Completion;
use chrono::{Local, NaiveDate, TimeDelta};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tidelog_format::{validate_record, ServerSecret};
use tracing::{debug, error, info, warn};

const QUEUE_THREAD_NAME: &str = "tidelog-mq";

/// Archive paths plus a description of how they were obtained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSnapshot {
    /// Archive files, ordered as requested.
    pub archives: Vec<PathBuf>,
    /// What happened: whether a flush ran, why not, and how many files were
    /// found.
    pub message: String,
}

struct ChannelShared {
    config: ChannelConfig,
    store: Mutex<LogStore>,
    expire_secs: AtomicU64,
    reading: Mutex<HashMap<PathBuf, usize>>,
    check_across_day: AtomicBool,
    closed: AtomicBool,
    stats: ChannelStats,
}

impl ChannelShared {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn write(&self, record: &[u8]) -> CoreResult<()> {
        let mut store = self.store.lock();
        let result = self.write_locked(&mut store, record);
        match &result {
            Ok(()) => self.stats.record_write(record.len()),
            Err(err) => {
                self.stats.record_write_failure();
                warn!(channel = %self.name(), error = %err, "write failed");
            }
        }
        result
    }

    fn write_locked(&self, store: &mut LogStore, record: &[u8]) -> CoreResult<()> {
        if self.check_across_day.load(Ordering::Acquire) {
            match self.flush_across_day(store, Local::now().date_naive()) {
                Ok(true) => self.check_across_day.store(false, Ordering::Release),
                Ok(false) => {}
                Err(err) => warn!(channel = %self.name(), error = %err, "day-boundary flush failed"),
            }
        }

        if store.append(record)? == AppendOutcome::Written {
            return Ok(());
        }
        debug!(channel = %self.name(), position = store.position(), "cache full, rotating");
        self.rotate(store)?;
        match store.append(record)? {
            AppendOutcome::Written => Ok(()),
            AppendOutcome::NeedsRotation => Err(CoreError::InsufficientSpace {
                needed: store.max_encoded_len(record.len()),
                available: store.space_left(),
            }),
        }
    }

    /// Moves the cache contents into an archive. Returns `false` if the
    /// cache held no records.
    fn rotate(&self, store: &mut LogStore) -> CoreResult<bool> {
        if store.record_count() == 0 {
            return Ok(false);
        }
        let root = &self.config.root_dir;
        if self.config.incremental_archive {
            let today = Local::now().date_naive();
            store.append_to(&day_archive_path(root, self.name(), today))?;
        } else {
            let mut at = Local::now();
            let mut dest = standalone_archive_path(root, self.name(), at);
            while dest.exists() {
                at += TimeDelta::milliseconds(1);
                dest = standalone_archive_path(root, self.name(), at);
            }
            store.archive_to(&dest)?;
        }
        self.stats.record_rotation();
        Ok(true)
    }

    fn rotate_logged(&self) -> CoreResult<bool> {
        let mut store = self.store.lock();
        let result = self.rotate(&mut store);
        if let Err(err) = &result {
            error!(channel = %self.name(), error = %err, "flush failed");
        }
        result
    }

    /// Moves a cache file created before `today` into the archive of the day
    /// it was created on. Returns `true` if the cache was replaced.
    fn flush_across_day(&self, store: &mut LogStore, today: NaiveDate) -> CoreResult<bool> {
        if !self.config.incremental_archive {
            return Ok(false);
        }
        let created = store.created_at().date_naive();
        if created >= today {
            return Ok(false);
        }
        if store.record_count() == 0 {
            debug!(channel = %self.name(), %created, "recreating empty cache from an earlier day");
            store.recreate()?;
            return Ok(true);
        }
        info!(channel = %self.name(), %created, records = store.record_count(), "flushing cache to its own day");
        store.append_to(&day_archive_path(&self.config.root_dir, self.name(), created))?;
        self.stats.record_rotation();
        Ok(true)
    }

    fn flush_across_day_logged(&self, today: NaiveDate) {
        let mut store = self.store.lock();
        if let Err(err) = self.flush_across_day(&mut store, today) {
            error!(channel = %self.name(), error = %err, "day-boundary flush failed");
        }
    }

    fn cleanup(&self) -> CoreResult<CleanupReport> {
        let files = collect_archives(
            &self.config.root_dir,
            self.name(),
            FileOrder::CreateTimeAscending,
        )?;
        let policy = RetentionPolicy {
            size_limit: self.config.total_archive_size_limit,
            expire: Duration::from_secs(self.expire_secs.load(Ordering::Acquire)),
            max_count: self.config.max_archive_count,
        };

        let reading = self.reading.lock();
        let plan = plan_cleanup(&files, &policy, SystemTime::now(), |path| {
            reading.contains_key(path)
        });
        let report = remove_planned(&plan);
        drop(reading);

        self.stats.record_removals(report.removed.len());
        if !report.is_empty() {
            debug!(
                channel = %self.name(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                "retention sweep"
            );
        }
        Ok(report)
    }

    fn remove_all(&self, include_reading: bool, reload_cache: bool) -> CoreResult<CleanupReport> {
        let files = collect_archives(&self.config.root_dir, self.name(), FileOrder::None)?;
        let mut report = CleanupReport::default();
        {
            let reading = self.reading.lock();
            for file in files {
                if include_reading || !reading.contains_key(&file.path) {
                    report.remove(&file.path);
                }
            }
        }
        self.stats.record_removals(report.removed.len());

        if reload_cache {
            let mut store = self.store.lock();
            if store.record_count() > 0 {
                debug!(channel = %self.name(), "discarding cached records");
                store.recreate()?;
            }
        }
        Ok(report)
    }

    fn unregister_reader(&self, path: &Path) {
        let mut reading = self.reading.lock();
        if let Some(count) = reading.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                reading.remove(path);
            }
        }
    }
}

/// A log channel.
///
/// # Example
///
/// ```no_run
/// use tidelog_core::{ArchiveCondition, Channel, ChannelConfig, FileOrder};
///
/// let channel = Channel::open(ChannelConfig::new("app", "/var/log/app").async_write(false))?;
/// channel.write(b"hello")?;
/// let snapshot = channel.archive_snapshot(ArchiveCondition::flush(), FileOrder::CreateTimeAscending)?;
/// for path in &snapshot.archives {
///     let mut reader = channel.open_reader(path, None)?;
///     while let Some(Ok(record)) = reader.next() {
///         println!("{} bytes", record.len());
///     }
/// }
/// # Ok::<(), tidelog_core::CoreError>(())
/// ```
pub struct Channel {
    shared: Arc<ChannelShared>,
    queue: Option<WriteQueue>,
}

impl Channel {
    /// Validates `config`, creates the root directory and opens the cache
    /// file.
    ///
    /// An asynchronous channel whose worker thread cannot be started falls
    /// back to synchronous writes. An incremental channel immediately files
    /// a cache left over from an earlier day.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for a bad configuration, or an
    /// I/O error if the directory or cache file cannot be created.
    pub fn open(config: ChannelConfig) -> CoreResult<Self> {
        let peer = config.validate()?;
        fs::create_dir_all(&config.root_dir)?;

        let store = LogStore::open(StoreOptions {
            channel: config.name.clone(),
            path: cache_path(&config.root_dir, &config.name),
            capacity: config.cache_capacity(),
            compress: config.compress_mode,
            peer,
        })?;

        let queue = if config.async_write {
            match WriteQueue::start(QUEUE_THREAD_NAME, config.queue_capacity) {
                Ok(queue) => Some(queue),
                Err(err) => {
                    warn!(channel = %config.name, error = %err, "fail to start write queue, writing synchronously");
                    None
                }
            }
        } else {
            None
        };

        let shared = Arc::new(ChannelShared {
            expire_secs: AtomicU64::new(config.expire_secs),
            store: Mutex::new(store),
            reading: Mutex::new(HashMap::new()),
            check_across_day: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: ChannelStats::new(),
            config,
        });
        let channel = Self { shared, queue };

        if channel.is_incremental() {
            let today = Local::now().date_naive();
            channel.submit(move |shared| shared.flush_across_day_logged(today))?;
        }
        info!(
            channel = %channel.name(),
            root = %channel.root_dir().display(),
            asynchronous = channel.is_async(),
            "channel opened"
        );
        Ok(channel)
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Directory holding the cache file and archives.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.shared.config.root_dir
    }

    /// The configuration the channel was opened with.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Whether rotations append to per-day archives.
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.shared.config.incremental_archive
    }

    /// Whether writes go through the write queue.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.queue.is_some()
    }

    /// Whether [`Channel::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Appends one record.
    ///
    /// An asynchronous channel copies the record and returns once it is
    /// queued; failures while writing it are logged and counted in
    /// [`Channel::stats`].
    ///
    /// # Errors
    ///
    /// Returns an error for an empty or oversized record, a closed channel,
    /// a full or stopped queue, or (synchronous channels) any write failure.
    pub fn write(&self, record: &[u8]) -> CoreResult<()> {
        self.check_open()?;
        validate_record(record)?;

        let Some(queue) = &self.queue else {
            return self.shared.write(record);
        };
        let shared = Arc::clone(&self.shared);
        let owned = record.to_vec();
        let queued = queue.enqueue(Box::new(move || {
            let _ = shared.write(&owned);
        }));
        if let Err(err) = queued {
            self.shared.stats.record_queue_rejection();
            return Err(err);
        }
        Ok(())
    }

    /// Rotates the cache file into an archive and waits for it.
    ///
    /// Returns `false` if there was nothing to rotate, or if an asynchronous
    /// channel did not finish within the flush timeout. A timed-out flush
    /// still completes in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the rotation fails or the channel is closed.
    pub fn flush(&self) -> CoreResult<bool> {
        self.check_open()?;
        match self.run_blocking(ChannelShared::rotate_logged)? {
            Some(result) => result,
            None => {
                warn!(
                    channel = %self.name(),
                    timeout_ms = self.flush_timeout_ms(),
                    "flush timeout"
                );
                Ok(false)
            }
        }
    }

    /// Rotates the cache if `condition` holds, then lists the archives.
    ///
    /// A flush that times out, fails or is refused by a full or stopped
    /// queue is not an error: the listing is still returned and the message
    /// says what happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed or the directory cannot be
    /// listed.
    pub fn archive_snapshot(
        &self,
        condition: ArchiveCondition,
        order: FileOrder,
    ) -> CoreResult<ArchiveSnapshot> {
        self.check_open()?;
        let (records, bytes) = {
            let store = self.shared.store.lock();
            (store.record_count(), store.payload_bytes())
        };
        let should_flush = condition.is_met(records, bytes);

        let mut message = format!(
            "get archive snapshot condition[flush:{}, min_total_bytes:{}, min_record_count:{}, order:{:?}]",
            condition.flush, condition.min_total_bytes, condition.min_record_count, order
        );
        if condition.flush && !should_flush {
            message.push_str(", skip flush");
            if condition.min_record_count > records {
                message.push_str(&format!(", insufficient records:{records}"));
            }
            if condition.min_total_bytes > bytes {
                message.push_str(&format!(", insufficient bytes:{bytes}"));
            }
        }

        if should_flush {
            match self.run_blocking(ChannelShared::rotate_logged) {
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(err))) => message.push_str(&format!(", flush failed: {err}")),
                Ok(None) => {
                    let timeout_ms = self.flush_timeout_ms();
                    warn!(channel = %self.name(), timeout_ms, "flush timeout");
                    message.push_str(&format!(", flush timeout after [{timeout_ms}] ms"));
                }
                Err(err) if err.is_back_pressure() => {
                    warn!(channel = %self.name(), error = %err, "flush not queued");
                    message.push_str(&format!(", flush not queued: {err}"));
                }
                Err(err) => return Err(err),
            }
        }

        let archives: Vec<PathBuf> = collect_archives(self.root_dir(), self.name(), order)?
            .into_iter()
            .map(|file| file.path)
            .collect();
        message.push_str(&format!(", snapshot files num:{}", archives.len()));
        debug!(channel = %self.name(), %message);
        Ok(ArchiveSnapshot { archives, message })
    }

    /// Opens an archive for reading and protects it from retention until
    /// the returned reader is dropped.
    ///
    /// `server_secret` is the hex private key matching the configured peer
    /// public key; without it encrypted records cannot be decoded. The path
    /// is protected exactly as given, so pass paths from
    /// [`Channel::archive_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed secret, a missing file or a header
    /// mismatch (the mismatched file is deleted).
    pub fn open_reader(&self, path: &Path, server_secret: Option<&str>) -> CoreResult<ArchiveReader> {
        self.check_open()?;
        let secret = server_secret.map(ServerSecret::from_hex).transpose()?;

        *self
            .shared
            .reading
            .lock()
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        match LogReader::open(path, self.name(), secret) {
            Ok(reader) => Ok(ArchiveReader {
                reader,
                shared: Arc::clone(&self.shared),
                path: path.to_path_buf(),
            }),
            Err(err) => {
                self.shared.unregister_reader(path);
                Err(err)
            }
        }
    }

    /// Closes a reader. Same as dropping it.
    pub fn close_reader(&self, reader: ArchiveReader) {
        drop(reader);
    }

    /// Whether any reader currently holds `path`.
    #[must_use]
    pub fn is_reading(&self, path: &Path) -> bool {
        self.shared.reading.lock().contains_key(path)
    }

    /// Changes the expiry age. Lowering it runs a retention sweep right
    /// away; returns `true` in that case.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep cannot list the archives.
    pub fn reset_expire_secs(&self, secs: u64) -> CoreResult<bool> {
        let previous = self.shared.expire_secs.swap(secs, Ordering::AcqRel);
        if secs < previous {
            self.shared.cleanup()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Current expiry age in seconds.
    #[must_use]
    pub fn expire_secs(&self) -> u64 {
        self.shared.expire_secs.load(Ordering::Acquire)
    }

    /// Runs the retention sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the archives cannot be listed.
    pub fn cleanup(&self) -> CoreResult<CleanupReport> {
        self.shared.cleanup()
    }

    /// Deletes one archive. A file held by a reader is kept unless
    /// `include_reading` is set. Returns `true` if a file was deleted.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than the file being absent.
    pub fn remove_archive(&self, path: &Path, include_reading: bool) -> CoreResult<bool> {
        let reading = self.shared.reading.lock();
        if !include_reading && reading.contains_key(path) {
            debug!(path = %path.display(), "archive in use, not removed");
            return Ok(false);
        }
        match fs::remove_file(path) {
            Ok(()) => {
                self.shared.stats.record_removals(1);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes every archive of the channel, sparing ones held by readers
    /// unless `include_reading` is set. With `reload_cache` the records
    /// still in the cache file are discarded too.
    ///
    /// An asynchronous channel runs this on its queue behind pending writes
    /// and waits up to the flush timeout; on timeout an empty report is
    /// returned and the removal completes in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed, the archives cannot be
    /// listed or the cache cannot be recreated.
    pub fn remove_all(&self, include_reading: bool, reload_cache: bool) -> CoreResult<CleanupReport> {
        self.check_open()?;
        match self.run_blocking(move |shared| shared.remove_all(include_reading, reload_cache))? {
            Some(result) => result,
            None => {
                warn!(channel = %self.name(), "remove all timed out");
                Ok(CleanupReport::default())
            }
        }
    }

    /// Archives dated `date` in local time.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn archives_of_date(&self, date: NaiveDate) -> CoreResult<Vec<PathBuf>> {
        Ok(collect_archives(self.root_dir(), self.name(), FileOrder::None)?
            .into_iter()
            .filter(|file| file.stamp.date() == date)
            .map(|file| file.path)
            .collect())
    }

    /// Path of the cache file.
    #[must_use]
    pub fn cache_file_path(&self) -> PathBuf {
        cache_path(self.root_dir(), self.name())
    }

    /// Mapped size of the cache file.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.shared.store.lock().capacity()
    }

    /// Records waiting in the cache file.
    #[must_use]
    pub fn pending_records(&self) -> usize {
        self.shared.store.lock().record_count()
    }

    /// Stored payload bytes waiting in the cache file.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.shared.store.lock().payload_bytes()
    }

    /// Counters of the channel.
    #[must_use]
    pub fn stats(&self) -> &ChannelStats {
        &self.shared.stats
    }

    /// Drains the write queue, syncs and unmaps the cache file. Later
    /// operations fail with [`CoreError::ChannelClosed`]. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = &self.queue {
            queue.join();
        }
        let mut store = self.shared.store.lock();
        if let Err(err) = store.sync() {
            debug!(channel = %self.name(), error = %err, "cache not synced on close");
        }
        store.close();
        info!(channel = %self.name(), "channel closed");
    }

    /// Arms or disarms the day-boundary check done before each write.
    pub(crate) fn set_check_across_day(&self, armed: bool) {
        self.shared.check_across_day.store(armed, Ordering::Release);
    }

    pub(crate) fn is_check_across_day_armed(&self) -> bool {
        self.shared.check_across_day.load(Ordering::Acquire)
    }

    /// One maintenance tick: file a leftover cache from an earlier day if
    /// armed, sweep archives, and flush incremental channels.
    pub(crate) fn run_maintenance(&self) {
        if self.is_closed() {
            return;
        }
        let incremental = self.is_incremental();
        if incremental && self.is_check_across_day_armed() {
            let today = Local::now().date_naive();
            if let Err(err) = self.submit(move |shared| shared.flush_across_day_logged(today)) {
                warn!(channel = %self.name(), error = %err, "day-boundary flush not queued");
            }
        }
        if let Err(err) = self.shared.cleanup() {
            warn!(channel = %self.name(), error = %err, "retention sweep failed");
        }
        if incremental {
            let queued = self.submit(|shared| {
                let _ = shared.rotate_logged();
            });
            if let Err(err) = queued {
                warn!(channel = %self.name(), error = %err, "maintenance flush not queued");
            }
        }
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::channel_closed(self.name()));
        }
        Ok(())
    }

    fn flush_timeout_ms(&self) -> u128 {
        self.shared.config.flush_timeout.as_millis()
    }

    /// Runs `task` on the queue if there is one, otherwise inline.
    fn submit(&self, task: impl FnOnce(&ChannelShared) + Send + 'static) -> CoreResult<()> {
        match &self.queue {
            Some(queue) => {
                let shared = Arc::clone(&self.shared);
                queue.enqueue(Box::new(move || task(&shared)))
            }
            None => {
                task(&self.shared);
                Ok(())
            }
        }
    }

    /// Like [`Self::submit`] but waits for the result. `None` means the
    /// flush timeout elapsed first.
    fn run_blocking<T, F>(&self, task: F) -> CoreResult<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&ChannelShared) -> T + Send + 'static,
    {
        let Some(queue) = &self.queue else {
            return Ok(Some(task(&self.shared)));
        };
        let done = Completion::new();
        let signal = Arc::clone(&done);
        let shared = Arc::clone(&self.shared);
        queue.enqueue(Box::new(move || signal.complete(task(&shared))))?;
        Ok(done.wait_timeout(self.shared.config.flush_timeout))
    }

    #[cfg(test)]
    fn flush_across_day_at(&self, today: NaiveDate) -> CoreResult<bool> {
        let mut store = self.shared.store.lock();
        self.shared.flush_across_day(&mut store, today)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("root_dir", &self.root_dir())
            .field("async", &self.is_async())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A [`LogReader`] registered with its channel.
///
/// While it exists, retention and non-forced removals leave its file alone.
pub struct ArchiveReader {
    reader: LogReader,
    shared: Arc<ChannelShared>,
    path: PathBuf,
}

impl Deref for ArchiveReader {
    type Target = LogReader;

    fn deref(&self) -> &LogReader {
        &self.reader
    }
}

impl DerefMut for ArchiveReader {
    fn deref_mut(&mut self) -> &mut LogReader {
        &mut self.reader
    }
}

impl Drop for ArchiveReader {
    fn drop(&mut self) {
        self.shared.unregister_reader(&self.path);
    }
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("reader", &self.reader)
            .finish()
    }
}
