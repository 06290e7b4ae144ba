//! Archive listing and the retention sweep.
//!
//! The sweep is split in two: [`plan_cleanup`] decides what to delete from
//! a listing, and [`remove_planned`] performs the deletions. The channel
//! holds its reading-set lock across both so a reader cannot be opened on a
//! file that is about to disappear.

use crate::config::FileOrder;
use crate::error::CoreResult;
use crate::naming::{parse_archive_name, ArchiveStamp};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// An archive file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Full path.
    pub path: PathBuf,
    /// Creation time, or modification time where the filesystem does not
    /// record creation.
    pub created: SystemTime,
    /// Size in bytes.
    pub size: u64,
    /// Timestamp parsed from the name.
    pub stamp: ArchiveStamp,
}

/// Lists the archives of `channel` under `root`.
///
/// # Errors
///
/// Returns an error if the directory cannot be read. Entries that vanish
/// while listing are skipped.
pub fn collect_archives(root: &Path, channel: &str, order: FileOrder) -> CoreResult<Vec<FileStat>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stamp) = name.to_str().and_then(|n| parse_archive_name(channel, n)) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(err) => {
                debug!(path = %entry.path().display(), error = %err, "skipping archive without metadata");
                continue;
            }
        };
        let created = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push(FileStat {
            path: entry.path(),
            created,
            size: meta.len(),
            stamp,
        });
    }

    match order {
        FileOrder::None => {}
        FileOrder::CreateTimeAscending => {
            files.sort_by(|a, b| (a.created, &a.path).cmp(&(b.created, &b.path)));
        }
        FileOrder::CreateTimeDescending => {
            files.sort_by(|a, b| (b.created, &b.path).cmp(&(a.created, &a.path)));
        }
    }
    Ok(files)
}

/// Limits enforced by the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Total archive bytes allowed.
    pub size_limit: u64,
    /// Age after which an archive expires.
    pub expire: Duration,
    /// Number of archives allowed, the newest included.
    pub max_count: usize,
}

/// Which limit a planned removal enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Total size above the limit.
    Size,
    /// Older than the expiry age.
    Age,
    /// More archives than allowed.
    Count,
}

/// One file the sweep wants gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRemoval {
    /// File to delete.
    pub path: PathBuf,
    /// Why.
    pub reason: RemovalReason,
}

/// Decides which archives to delete.
///
/// `ascending` must be sorted oldest first. The newest archive and every
/// archive for which `is_reading` holds are never selected. Limits are
/// applied in order: size, then age, then count.
///
/// The size phase subtracts a file's size from the running total as soon as
/// it is selected, whether or not the later delete succeeds.
pub fn plan_cleanup(
    ascending: &[FileStat],
    policy: &RetentionPolicy,
    now: SystemTime,
    is_reading: impl Fn(&Path) -> bool,
) -> Vec<PlannedRemoval> {
    let Some((_newest, candidates)) = ascending.split_last() else {
        return Vec::new();
    };
    let expired = |file: &FileStat| {
        now.duration_since(file.created)
            .is_ok_and(|age| age > policy.expire)
    };

    let mut removals = Vec::new();
    let mut total: u64 = ascending.iter().map(|f| f.size).sum();
    let mut remaining = Vec::with_capacity(candidates.len());
    for file in candidates {
        if total > policy.size_limit && !is_reading(&file.path) {
            total = total.saturating_sub(file.size);
            removals.push(PlannedRemoval {
                path: file.path.clone(),
                reason: RemovalReason::Size,
            });
        } else {
            remaining.push(file);
        }
    }

    if remaining.first().is_some_and(|oldest| expired(*oldest)) {
        remaining.retain(|file| {
            if expired(*file) && !is_reading(&file.path) {
                removals.push(PlannedRemoval {
                    path: file.path.clone(),
                    reason: RemovalReason::Age,
                });
                false
            } else {
                true
            }
        });
    }

    let mut excess = (remaining.len() + 1).saturating_sub(policy.max_count);
    for file in remaining {
        if excess == 0 {
            break;
        }
        if !is_reading(&file.path) {
            removals.push(PlannedRemoval {
                path: file.path.clone(),
                reason: RemovalReason::Count,
            });
            excess -= 1;
        }
    }
    removals
}

/// Outcome of a retention sweep or bulk removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files deleted.
    pub removed: Vec<PathBuf>,
    /// Files that could not be deleted.
    pub failed: Vec<PathBuf>,
}

impl CleanupReport {
    /// Returns `true` if nothing was attempted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.failed.is_empty()
    }

    pub(crate) fn remove(&mut self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "archive removed");
                self.removed.push(path.to_path_buf());
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "fail to remove archive");
                self.failed.push(path.to_path_buf());
            }
        }
    }
}

/// Deletes the planned files.
pub fn remove_planned(plan: &[PlannedRemoval]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for removal in plan {
        debug!(path = %removal.path.display(), reason = ?removal.reason, "retention removal");
        report.remove(&removal.path);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn stat(name: &str, age_days: u64, size: u64, now: SystemTime) -> FileStat {
        FileStat {
            path: PathBuf::from(name),
            created: now - DAY * age_days as u32,
            size,
            stamp: ArchiveStamp::Day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
        }
    }

    fn policy(size_limit: u64, expire_days: u64, max_count: usize) -> RetentionPolicy {
        RetentionPolicy {
            size_limit,
            expire: DAY * expire_days as u32,
            max_count,
        }
    }

    fn paths(plan: &[PlannedRemoval]) -> Vec<&str> {
        plan.iter().map(|r| r.path.to_str().unwrap()).collect()
    }

    #[test]
    fn newest_is_never_removed() {
        let now = SystemTime::now();
        let files = vec![stat("only", 100, 1_000, now)];
        assert!(plan_cleanup(&files, &policy(0, 1, 1), now, |_| false).is_empty());
    }

    #[test]
    fn size_phase_removes_oldest_first() {
        let now = SystemTime::now();
        let files = vec![
            stat("a", 5, 100, now),
            stat("b", 4, 100, now),
            stat("c", 3, 100, now),
            stat("d", 2, 100, now),
        ];
        let plan = plan_cleanup(&files, &policy(250, 30, 30), now, |_| false);
        assert_eq!(paths(&plan), vec!["a", "b"]);
        assert!(plan.iter().all(|r| r.reason == RemovalReason::Size));
    }

    #[test]
    fn size_phase_skips_reading_files() {
        let now = SystemTime::now();
        let files = vec![
            stat("a", 5, 100, now),
            stat("b", 4, 100, now),
            stat("c", 3, 100, now),
        ];
        let plan = plan_cleanup(&files, &policy(150, 30, 30), now, |p| p == Path::new("a"));
        assert_eq!(paths(&plan), vec!["b"]);
    }

    #[test]
    fn age_phase_needs_expired_oldest() {
        let now = SystemTime::now();
        let files = vec![
            stat("a", 10, 1, now),
            stat("b", 9, 1, now),
            stat("c", 1, 1, now),
            stat("d", 0, 1, now),
        ];
        let plan = plan_cleanup(&files, &policy(u64::MAX, 7, 30), now, |_| false);
        assert_eq!(paths(&plan), vec!["a", "b"]);
        assert!(plan.iter().all(|r| r.reason == RemovalReason::Age));

        let fresh = plan_cleanup(&files, &policy(u64::MAX, 30, 30), now, |_| false);
        assert!(fresh.is_empty());
    }

    #[test]
    fn count_phase_keeps_newest_within_limit() {
        let now = SystemTime::now();
        let files: Vec<_> = (0..6).map(|i| stat(&format!("f{i}"), 6 - i, 1, now)).collect();
        let plan = plan_cleanup(&files, &policy(u64::MAX, 30, 4), now, |_| false);
        assert_eq!(paths(&plan), vec!["f0", "f1"]);
        assert!(plan.iter().all(|r| r.reason == RemovalReason::Count));
    }

    #[test]
    fn collect_lists_only_own_archives() {
        let dir = tempdir().unwrap();
        for name in [
            "app-20240101.log",
            "app-20240102120000000.log",
            "app.cache",
            "other-20240101.log",
            "app-2024.log",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("app-20240103.log")).unwrap();

        let mut names: Vec<_> = collect_archives(dir.path(), "app", FileOrder::None)
            .unwrap()
            .into_iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["app-20240101.log", "app-20240102120000000.log"]);
    }

    #[test]
    fn remove_planned_reports_failures() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("app-20240101.log");
        fs::write(&present, b"x").unwrap();
        let plan = vec![
            PlannedRemoval {
                path: present.clone(),
                reason: RemovalReason::Size,
            },
            PlannedRemoval {
                path: dir.path().join("app-20240102.log"),
                reason: RemovalReason::Age,
            },
        ];
        let report = remove_planned(&plan);
        assert_eq!(report.removed, vec![present]);
        assert_eq!(report.failed.len(), 1);
    }

    proptest! {
        #[test]
        fn sweep_respects_limits(
            sizes in prop::collection::vec(1u64..10_000, 1..40),
            reading in prop::collection::hash_set(0usize..40, 0..5),
            limit in 0u64..100_000,
            max_count in 1usize..20,
        ) {
            let now = SystemTime::now();
            let count = sizes.len();
            let files: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| stat(&format!("f{i:02}"), (count - i) as u64, *size, now))
                .collect();
            let reading: HashSet<PathBuf> = reading
                .into_iter()
                .filter(|i| *i < count)
                .map(|i| PathBuf::from(format!("f{i:02}")))
                .collect();

            let plan = plan_cleanup(&files, &policy(limit, 1_000, max_count), now, |p| reading.contains(p));
            let removed: HashSet<_> = plan.iter().map(|r| r.path.clone()).collect();

            prop_assert!(!removed.contains(&files[count - 1].path));
            prop_assert!(removed.is_disjoint(&reading));
            prop_assert_eq!(removed.len(), plan.len());

            let left: Vec<_> = files.iter().filter(|f| !removed.contains(&f.path)).collect();
            let protected_or_newest = |f: &&FileStat| reading.contains(&f.path) || f.path == files[count - 1].path;
            let total: u64 = left.iter().map(|f| f.size).sum();
            prop_assert!(total <= limit || left.iter().all(protected_or_newest));
            prop_assert!(left.len() <= max_count || left.iter().all(protected_or_newest));
        }
    }
}
