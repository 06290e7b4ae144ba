//! Reading archives that were damaged after rotation.

use proptest::prelude::*;
use std::fs;
use tidelog_core::{CompressMode, CoreError, LogReader};
use tidelog_format::ModeByte;
use tidelog_storage::InMemoryBackend;
use tidelog_testkit::prelude::*;

fn with_mode(name: &str, mode: CompressMode) -> TempChannel {
    TempChannel::open(name, |config| config.async_write(false).compress_mode(mode))
}

fn plain(name: &str) -> TempChannel {
    with_mode(name, CompressMode::None)
}

#[test]
fn damaged_record_is_skipped_and_reported() {
    let temp = plain("damage");
    for record in numbered_records("d", 6) {
        temp.write(&record).unwrap();
    }
    let archive = temp.flush_and_list().remove(0);
    corrupt_record_mode(&archive, "damage", 3).unwrap();

    let mut reader = temp.open_reader(&archive, None).unwrap();
    let results: Vec<_> = reader.by_ref().collect();
    assert_eq!(results.len(), 6);
    let err = results[3].as_ref().unwrap_err();
    assert_eq!(err.code(), -4);

    let intact: Vec<Vec<u8>> = results.into_iter().filter_map(Result::ok).collect();
    let mut expected = numbered_records("d", 6);
    expected.remove(3);
    assert_eq!(intact, expected);
}

#[test]
fn zlib_damage_leaves_later_records_intact() {
    let temp = with_mode("zdamage", CompressMode::Zlib);
    let line = "GET /api/orders?page=2 status=503 upstream=inventory latency_ms=1200 ";
    let records: Vec<Vec<u8>> = vec![
        b"start".to_vec(),
        b"warming caches".to_vec(),
        line.repeat(2).into_bytes(),
        format!("{line}{line}retrying").into_bytes(),
        b"recovered".to_vec(),
        b"shutdown".to_vec(),
    ];
    for record in &records {
        temp.write(record).unwrap();
    }
    let archive = temp.flush_and_list().remove(0);
    corrupt_record_mode(&archive, "zdamage", 2).unwrap();

    let mut reader = temp.open_reader(&archive, None).unwrap();
    let results: Vec<_> = reader.by_ref().collect();
    assert_eq!(results.len(), 6);
    assert_eq!(results[2].as_ref().unwrap_err().code(), -4);

    let intact: Vec<Vec<u8>> = results.into_iter().filter_map(Result::ok).collect();
    let mut expected = records;
    expected.remove(2);
    assert_eq!(intact, expected);
}

#[test]
fn truncated_archive_keeps_complete_records() {
    let temp = plain("trunc");
    for record in numbered_records("x", 4) {
        temp.write(&record).unwrap();
    }
    let archive = temp.flush_and_list().remove(0);
    truncate_tail(&archive, 3).unwrap();

    let records = read_archive(&temp, &archive, None);
    assert_eq!(records, numbered_records("x", 3));
    assert_eq!(count_damaged(&temp, &archive, None), 1);
}

#[test]
fn archive_of_another_channel_is_rejected_and_deleted() {
    let temp = plain("owner");
    temp.write(b"private").unwrap();
    let archive = temp.flush_and_list().remove(0);

    let other = plain("other");
    let err = other.open_reader(&archive, None).unwrap_err();
    assert!(matches!(err, CoreError::HeaderRejected { .. }));
    assert!(!archive.exists());
    assert!(!other.is_reading(&archive));
}

#[test]
fn reader_over_memory_backend_matches_file_reader() {
    let temp = plain("mem");
    for record in numbered_records("y", 3) {
        temp.write(&record).unwrap();
    }
    let archive = temp.flush_and_list().remove(0);
    let bytes = fs::read(&archive).unwrap();

    let reader = LogReader::from_backend(InMemoryBackend::with_data(bytes), "mem", None).unwrap();
    let records: Vec<Vec<u8>> = reader.map(Result::unwrap).collect();
    assert_eq!(records, numbered_records("y", 3));

    let err = LogReader::from_backend(InMemoryBackend::new(), "mem", None).unwrap_err();
    assert!(matches!(err, CoreError::HeaderRejected { .. }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn records_after_damage_still_decode(
        records in record_batch_strategy(12),
        victim in any::<prop::sample::Index>(),
        noise in 1u8..=255,
        mode in compress_mode_strategy(),
    ) {
        let temp = with_mode("prop", mode);
        for record in &records {
            temp.write(record).unwrap();
        }
        let archive = temp.flush_and_list().remove(0);
        let bytes = fs::read(&archive).unwrap();
        let index = victim.index(records.len());
        let offset = record_offsets(&bytes, "prop")[index];
        let original = bytes[offset];
        let damaged = original ^ noise;
        prop_assume!(ModeByte::from_byte(damaged).is_none());
        overwrite_byte(&archive, offset, damaged).unwrap();

        let decoded = read_archive(&temp, &archive, None);
        let mut expected = records.clone();
        expected.remove(index);
        prop_assert_eq!(decoded, expected);
    }
}
