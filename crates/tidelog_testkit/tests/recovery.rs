//! Reloading cache files after clean shutdowns, torn writes and damage.

use std::fs;
use tidelog_core::CompressMode;
use tidelog_testkit::prelude::*;

fn plain(name: &str) -> TempChannel {
    TempChannel::open(name, |config| {
        config.async_write(false).compress_mode(CompressMode::None)
    })
}

#[test]
fn reload_is_idempotent() {
    init_tracing();
    let temp = plain("reload");
    for record in numbered_records("r", 10) {
        temp.write(&record).unwrap();
    }
    let records = temp.pending_records();
    let bytes = temp.pending_bytes();

    let temp = temp.reopen();
    assert_eq!(temp.pending_records(), records);
    assert_eq!(temp.pending_bytes(), bytes);

    let temp = temp.reopen();
    assert_eq!(temp.pending_records(), records);
    assert_eq!(temp.pending_bytes(), bytes);
    assert_eq!(temp.drain(None), numbered_records("r", 10));
}

#[test]
fn writes_resume_after_reload() {
    let temp = plain("resume");
    temp.write(b"before").unwrap();
    let temp = temp.reopen();
    temp.write(b"after").unwrap();
    assert_eq!(temp.drain(None), vec![b"before".to_vec(), b"after".to_vec()]);
}

#[test]
fn compressed_cache_survives_reload() {
    let temp = TempChannel::sync("zlib");
    temp.write(b"first stream").unwrap();
    let temp = temp.reopen();
    temp.write(b"second stream").unwrap();
    assert_eq!(
        temp.drain(None),
        vec![b"first stream".to_vec(), b"second stream".to_vec()]
    );
}

#[test]
fn torn_last_record_is_dropped() {
    let temp = plain("torn");
    for record in numbered_records("t", 5) {
        temp.write(&record).unwrap();
    }
    temp.close();

    let cache = temp.cache_file_path();
    let bytes = fs::read(&cache).unwrap();
    let end = record_end(&bytes, "torn", 4).unwrap();
    overwrite_byte(&cache, end - 1, 0).unwrap();

    let temp = temp.reopen();
    assert_eq!(temp.pending_records(), 4);
    temp.write(b"t-new").unwrap();

    let mut expected = numbered_records("t", 4);
    expected.push(b"t-new".to_vec());
    assert_eq!(temp.drain(None), expected);
}

#[test]
fn damaged_middle_record_is_skipped_on_reload() {
    let temp = plain("middle");
    for record in numbered_records("m", 5) {
        temp.write(&record).unwrap();
    }
    temp.close();

    corrupt_record_mode(&temp.cache_file_path(), "middle", 2).unwrap();

    let temp = temp.reopen();
    assert_eq!(temp.pending_records(), 4);
    let records = temp.drain(None);
    assert_eq!(
        records,
        vec![
            b"m-0".to_vec(),
            b"m-1".to_vec(),
            b"m-3".to_vec(),
            b"m-4".to_vec()
        ]
    );
}

#[test]
fn cache_with_foreign_header_is_replaced() {
    let temp = plain("foreign");
    temp.write(b"lost").unwrap();
    temp.close();

    corrupt_header(&temp.cache_file_path()).unwrap();

    let temp = temp.reopen();
    assert_eq!(temp.pending_records(), 0);
    temp.write(b"fresh").unwrap();
    assert_eq!(temp.drain(None), vec![b"fresh".to_vec()]);
}
