//! File names of cache files and archives.
//!
//! ```text
//! <root>/<channel>.cache                    cache file
//! <root>/<channel>-<YYYYMMDDHHmmssSSS>.log  standalone archive
//! <root>/<channel>-<YYYYMMDD>.log           incremental (per-day) archive
//! ```
//!
//! Timestamps are local time.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};

const CACHE_EXTENSION: &str = "cache";
const ARCHIVE_EXTENSION: &str = "log";
const DAY_DIGITS: usize = 8;
const INSTANT_DIGITS: usize = 17;

/// The timestamp encoded in an archive name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStamp {
    /// Incremental archive for one calendar day.
    Day(NaiveDate),
    /// Standalone archive rotated at this instant.
    Instant(NaiveDateTime),
}

impl ArchiveStamp {
    /// Calendar day of the stamp.
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Day(date) => *date,
            Self::Instant(at) => at.date(),
        }
    }
}

/// Path of the cache file of `channel`.
#[must_use]
pub fn cache_path(root: &Path, channel: &str) -> PathBuf {
    root.join(format!("{channel}.{CACHE_EXTENSION}"))
}

/// Path of the standalone archive rotated at `at`.
#[must_use]
pub fn standalone_archive_path(root: &Path, channel: &str, at: DateTime<Local>) -> PathBuf {
    root.join(format!(
        "{channel}-{}.{ARCHIVE_EXTENSION}",
        at.format("%Y%m%d%H%M%S%3f")
    ))
}

/// Path of the incremental archive for `date`.
#[must_use]
pub fn day_archive_path(root: &Path, channel: &str, date: NaiveDate) -> PathBuf {
    root.join(format!(
        "{channel}-{}.{ARCHIVE_EXTENSION}",
        date.format("%Y%m%d")
    ))
}

/// Parses an archive file name belonging to `channel`.
///
/// Returns `None` for the cache file, other channels' files and anything
/// that is not a well-formed archive name.
#[must_use]
pub fn parse_archive_name(channel: &str, file_name: &str) -> Option<ArchiveStamp> {
    let digits = file_name
        .strip_prefix(channel)?
        .strip_prefix('-')?
        .strip_suffix(ARCHIVE_EXTENSION)?
        .strip_suffix('.')?;
    if !matches!(digits.len(), DAY_DIGITS | INSTANT_DIGITS)
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let field = |range: std::ops::Range<usize>| digits[range].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(i32::try_from(field(0..4)?).ok()?, field(4..6)?, field(6..8)?)?;
    if digits.len() == DAY_DIGITS {
        return Some(ArchiveStamp::Day(date));
    }
    date.and_hms_milli_opt(field(8..10)?, field(10..12)?, field(12..14)?, field(14..17)?)
        .map(ArchiveStamp::Instant)
}
