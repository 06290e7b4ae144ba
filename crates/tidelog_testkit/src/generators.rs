//! Property-based test generators using proptest.
//!
//! Records never contain the sync marker's first byte, so marker-based
//! helpers in [`crate::corruption`] stay exact.

use proptest::prelude::*;
use tidelog_core::{CompressMode, MAX_RECORD_LEN};
use tidelog_format::SYNC_MARKER;

/// Strategy for one record of at most `max_len` bytes.
pub fn record_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    let max_len = max_len.clamp(1, MAX_RECORD_LEN);
    prop::collection::vec(
        any::<u8>().prop_filter("Record must not start a sync marker", |b| {
            *b != SYNC_MARKER[0]
        }),
        1..=max_len,
    )
}

/// Strategy for a batch of short records.
pub fn record_batch_strategy(max_records: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(record_strategy(256), 1..=max_records.max(1))
}

/// Strategy for valid channel names.
pub fn channel_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_-]{0,31}").expect("Invalid regex")
}

/// Strategy for compression modes.
pub fn compress_mode_strategy() -> impl Strategy<Value = CompressMode> {
    prop_oneof![Just(CompressMode::None), Just(CompressMode::Zlib)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn records_are_bounded_and_non_empty() {
        let mut runner = TestRunner::default();
        let strategy = record_strategy(16);
        for _ in 0..50 {
            let record = strategy.new_tree(&mut runner).unwrap().current();
            assert!(!record.is_empty());
            assert!(record.len() <= 16);
            assert!(!record.contains(&SYNC_MARKER[0]));
        }
    }

    #[test]
    fn channel_names_are_valid() {
        let mut runner = TestRunner::default();
        let strategy = channel_name_strategy();
        for _ in 0..50 {
            let name = strategy.new_tree(&mut runner).unwrap().current();
            assert!(!name.is_empty());
            assert!(!name.contains('/'));
        }
    }
}
