//! Temporary channels and archive helpers.
//!
//! Every fixture owns a [`TempDir`] so files disappear with the test.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tidelog_core::{ArchiveCondition, Channel, ChannelConfig, FileOrder};

/// Cache size used by fixtures, in pages. Small enough that rotations are
/// easy to provoke, large enough for one maximum-size record.
pub const FIXTURE_CACHE_PAGES: usize = 8;

/// A channel rooted in a temporary directory.
pub struct TempChannel {
    /// The channel instance.
    pub channel: Channel,
    /// The temporary directory (kept alive to prevent cleanup).
    dir: TempDir,
}

impl TempChannel {
    /// Opens a synchronous channel with default settings.
    pub fn sync(name: &str) -> Self {
        Self::open(name, |config| config.async_write(false))
    }

    /// Opens an asynchronous channel with default settings.
    pub fn asynchronous(name: &str) -> Self {
        Self::open(name, |config| config.async_write(true))
    }

    /// Opens a channel after letting `configure` adjust the configuration.
    pub fn open(name: &str, configure: impl FnOnce(ChannelConfig) -> ChannelConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = configure(
            ChannelConfig::new(name, dir.path().join("logs")).cache_pages(FIXTURE_CACHE_PAGES),
        );
        let channel = Channel::open(config).expect("Failed to open channel");
        Self { channel, dir }
    }

    /// Closes the channel and opens it again on the same files.
    pub fn reopen(self) -> Self {
        let Self { channel, dir } = self;
        let config = channel.config().clone();
        drop(channel);
        let channel = Channel::open(config).expect("Failed to reopen channel");
        Self { channel, dir }
    }

    /// The temporary directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Rotates the cache and returns every archive, oldest first.
    pub fn flush_and_list(&self) -> Vec<PathBuf> {
        self.channel
            .archive_snapshot(ArchiveCondition::flush(), FileOrder::CreateTimeAscending)
            .expect("Failed to take archive snapshot")
            .archives
    }

    /// Rotates the cache and decodes every intact record of every archive,
    /// oldest archive first.
    pub fn drain(&self, secret: Option<&str>) -> Vec<Vec<u8>> {
        self.flush_and_list()
            .iter()
            .flat_map(|path| read_archive(&self.channel, path, secret))
            .collect()
    }
}

impl std::ops::Deref for TempChannel {
    type Target = Channel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

/// Decodes the intact records of one archive, skipping damaged ones.
pub fn read_archive(channel: &Channel, path: &Path, secret: Option<&str>) -> Vec<Vec<u8>> {
    let mut reader = channel
        .open_reader(path, secret)
        .expect("Failed to open archive reader");
    reader.by_ref().filter_map(Result::ok).collect()
}

/// Counts the damaged records of one archive.
pub fn count_damaged(channel: &Channel, path: &Path, secret: Option<&str>) -> usize {
    let mut reader = channel
        .open_reader(path, secret)
        .expect("Failed to open archive reader");
    reader.by_ref().filter(Result::is_err).count()
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Records `"{prefix}-0"`, `"{prefix}-1"`, and so on.
pub fn numbered_records(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("{prefix}-{i}").into_bytes())
        .collect()
}
