//! # tidelog Core
//!
//! Crash-resilient append-only log channels.
//!
//! This crate provides:
//! - [`LogStore`]: the memory-mapped cache file records are appended to
//! - [`LogReader`]: sequential, self-healing decoding of archive files
//! - [`Channel`]: rotation of the cache into dated archives, retention and
//!   reader tracking
//! - [`WriteQueue`]: the single-consumer queue serializing asynchronous
//!   channels
//! - [`MaintenanceDaemon`] and [`Registry`]: process-wide channel ownership
//!   and periodic upkeep
//!
//! Diagnostics are emitted through `tracing`; attach a subscriber to see
//! them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod channel;
mod config;
mod daemon;
mod error;
mod naming;
mod queue;
mod reader;
mod registry;
mod stats;
mod store;
mod sync;

pub use archive::{
    collect_archives, plan_cleanup, remove_planned, CleanupReport, FileStat, PlannedRemoval,
    RemovalReason, RetentionPolicy,
};
pub use channel::{ArchiveReader, ArchiveSnapshot, Channel};
pub use config::{
    ArchiveCondition, ChannelConfig, DaemonConfig, FileOrder, DEFAULT_CACHE_PAGES,
    DEFAULT_EXPIRE_SECS, DEFAULT_FLUSH_TIMEOUT, DEFAULT_MAX_ARCHIVE_COUNT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_TOTAL_ARCHIVE_SIZE_LIMIT,
};
pub use daemon::{near_midnight, tick, MaintenanceDaemon};
pub use error::{CoreError, CoreResult};
pub use naming::{
    cache_path, day_archive_path, parse_archive_name, standalone_archive_path, ArchiveStamp,
};
pub use queue::{Task, WriteQueue};
pub use reader::{LogReader, ReadError};
pub use registry::Registry;
pub use stats::{ChannelStats, StatsSnapshot};
pub use store::{AppendOutcome, LogStore, StoreOptions, MAX_LOAD_ATTEMPTS};

pub use tidelog_format::{CompressMode, EncryptMode, KeyPair, MAX_RECORD_LEN};
