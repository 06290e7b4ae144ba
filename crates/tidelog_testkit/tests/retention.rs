//! Retention sweeps over real archive directories.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tidelog_core::{ArchiveCondition, Channel, ChannelConfig, FileOrder};
use tidelog_testkit::prelude::*;

fn with_archives(temp: &TempChannel, count: usize) -> Vec<PathBuf> {
    for i in 0..count {
        temp.write(format!("archive-{i}").as_bytes()).unwrap();
        assert!(temp.flush().unwrap());
    }
    listing(temp)
}

fn listing(temp: &TempChannel) -> Vec<PathBuf> {
    temp.archive_snapshot(ArchiveCondition::skip_flush(), FileOrder::CreateTimeAscending)
        .unwrap()
        .archives
}

fn total_size(paths: &[PathBuf]) -> u64 {
    paths.iter().map(|p| fs::metadata(p).unwrap().len()).sum()
}

#[test]
fn count_limit_keeps_newest() {
    init_tracing();
    let temp = TempChannel::open("count", |config| {
        config.async_write(false).max_archive_count(3)
    });
    let archives = with_archives(&temp, 5);

    let report = temp.cleanup().unwrap();
    assert_eq!(report.removed, archives[..2].to_vec());
    assert_eq!(listing(&temp), archives[2..].to_vec());
    assert_eq!(temp.stats().archives_removed(), 2);
}

#[test]
fn size_limit_spares_newest_and_readers() {
    let temp = TempChannel::open("size", |config| {
        config.async_write(false).total_archive_size_limit(1)
    });
    let archives = with_archives(&temp, 4);

    let reader = temp.open_reader(&archives[1], None).unwrap();
    temp.cleanup().unwrap();
    assert_eq!(listing(&temp), vec![archives[1].clone(), archives[3].clone()]);

    drop(reader);
    assert!(!temp.is_reading(&archives[1]));
    temp.cleanup().unwrap();
    assert_eq!(listing(&temp), vec![archives[3].clone()]);
}

#[test]
fn size_sweep_leaves_total_under_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = ChannelConfig::new("under", dir.path())
        .async_write(false)
        .cache_pages(FIXTURE_CACHE_PAGES);

    let channel = Channel::open(config.clone()).unwrap();
    for i in 0..6 {
        channel.write(format!("archive-{i}").as_bytes()).unwrap();
        channel.flush().unwrap();
    }
    let archives = channel
        .archive_snapshot(ArchiveCondition::skip_flush(), FileOrder::CreateTimeAscending)
        .unwrap()
        .archives;
    assert_eq!(archives.len(), 6);
    let limit = total_size(&archives[3..]);
    drop(channel);

    let channel = Channel::open(config.total_archive_size_limit(limit)).unwrap();
    let report = channel.cleanup().unwrap();
    assert_eq!(report.removed, archives[..3].to_vec());

    let left = channel
        .archive_snapshot(ArchiveCondition::skip_flush(), FileOrder::CreateTimeAscending)
        .unwrap()
        .archives;
    assert!(total_size(&left) <= limit);
    assert_eq!(left, archives[3..].to_vec());
}

#[test]
fn lowering_expiry_sweeps_old_archives() {
    let temp = TempChannel::sync("expiry");
    let archives = with_archives(&temp, 3);
    thread::sleep(Duration::from_millis(20));

    assert!(!temp.reset_expire_secs(temp.expire_secs() + 1).unwrap());
    assert_eq!(listing(&temp).len(), 3);

    assert!(temp.reset_expire_secs(0).unwrap());
    assert_eq!(temp.expire_secs(), 0);
    assert_eq!(listing(&temp), vec![archives[2].clone()]);
}

#[test]
fn expiry_spares_archives_being_read() {
    let temp = TempChannel::sync("reading");
    let archives = with_archives(&temp, 3);
    let _first = temp.open_reader(&archives[0], None).unwrap();
    let _second = temp.open_reader(&archives[0], None).unwrap();
    thread::sleep(Duration::from_millis(20));

    temp.reset_expire_secs(0).unwrap();
    assert_eq!(listing(&temp), vec![archives[0].clone(), archives[2].clone()]);
}

#[test]
fn remove_archive_respects_readers_unless_forced() {
    let temp = TempChannel::sync("single");
    let archives = with_archives(&temp, 2);
    let reader = temp.open_reader(&archives[0], None).unwrap();

    assert!(!temp.remove_archive(&archives[0], false).unwrap());
    assert!(archives[0].exists());
    assert!(temp.remove_archive(&archives[0], true).unwrap());
    assert!(!archives[0].exists());
    assert!(!temp.remove_archive(&archives[0], true).unwrap());
    drop(reader);

    assert!(temp.remove_archive(&archives[1], false).unwrap());
    assert!(listing(&temp).is_empty());
}

#[test]
fn remove_all_with_and_without_readers() {
    let temp = TempChannel::sync("all");
    let archives = with_archives(&temp, 3);
    temp.write(b"cached").unwrap();
    let reader = temp.open_reader(&archives[0], None).unwrap();

    let report = temp.remove_all(false, false).unwrap();
    assert_eq!(report.removed.len(), 2);
    assert_eq!(listing(&temp), vec![archives[0].clone()]);
    assert_eq!(temp.pending_records(), 1);

    let report = temp.remove_all(true, true).unwrap();
    assert_eq!(report.removed, vec![archives[0].clone()]);
    assert_eq!(temp.pending_records(), 0);
    drop(reader);
    assert!(listing(&temp).is_empty());
}
