//! Encrypted channels.

use tidelog_core::{CompressMode, KeyPair};
use tidelog_testkit::prelude::*;

#[test]
fn records_round_trip_with_the_server_secret() {
    init_tracing();
    let pair = KeyPair::generate();
    for mode in [CompressMode::None, CompressMode::Zlib] {
        let temp = TempChannel::open("sealed", |config| {
            config
                .async_write(false)
                .compress_mode(mode)
                .encrypt_with(pair.public_hex())
        });
        let records = numbered_records("secret", 20);
        for record in &records {
            temp.write(record).unwrap();
        }
        let secret = pair.secret_hex();
        assert_eq!(temp.drain(Some(secret.as_str())), records);
    }
}

#[test]
fn records_stay_sealed_without_the_secret() {
    let pair = KeyPair::generate();
    let temp = TempChannel::open("locked", |config| {
        config.async_write(false).encrypt_with(pair.public_hex())
    });
    temp.write(b"hidden").unwrap();
    let archive = temp.flush_and_list().remove(0);

    let mut reader = temp.open_reader(&archive, None).unwrap();
    let err = reader.read_record().unwrap_err();
    assert_eq!(err.code(), -5);
    assert_eq!(reader.read_record().unwrap(), None);

    let bytes = std::fs::read(&archive).unwrap();
    assert!(!bytes.windows(6).any(|w| w == b"hidden"));
}

#[test]
fn encrypted_cache_survives_reload() {
    let pair = KeyPair::generate();
    let temp = TempChannel::open("rekey", |config| {
        config
            .async_write(false)
            .compress_mode(CompressMode::None)
            .encrypt_with(pair.public_hex())
    });
    temp.write(b"old session").unwrap();
    let temp = temp.reopen();
    temp.write(b"new session").unwrap();

    let secret = pair.secret_hex();
    assert_eq!(
        temp.drain(Some(secret.as_str())),
        vec![b"old session".to_vec(), b"new session".to_vec()]
    );
}

#[test]
fn malformed_secret_is_rejected() {
    let pair = KeyPair::generate();
    let temp = TempChannel::open("badkey", |config| {
        config.async_write(false).encrypt_with(pair.public_hex())
    });
    temp.write(b"x").unwrap();
    let archive = temp.flush_and_list().remove(0);
    assert!(temp.open_reader(&archive, Some("not hex")).is_err());
    assert!(!temp.is_reading(&archive));
}
