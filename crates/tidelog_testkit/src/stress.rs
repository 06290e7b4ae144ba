//! Concurrent writer harnesses.
//!
//! Writers tag their records as `"w{writer}-{seq}"` so a reader can check
//! that each writer's records come back complete and in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tidelog_core::Channel;

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Writes attempted.
    pub total_ops: usize,
    /// Writes accepted.
    pub successful_ops: usize,
    /// Writes rejected.
    pub failed_ops: usize,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl StressResult {
    /// Accepted writes per second.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.successful_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration of a stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of writer threads.
    pub threads: usize,
    /// Records written by each thread.
    pub records_per_thread: usize,
    /// Padding appended to each record.
    pub padding: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            records_per_thread: 1_000,
            padding: 32,
        }
    }
}

/// The `seq`-th record of `writer`.
pub fn tagged_record(writer: usize, seq: usize, padding: usize) -> Vec<u8> {
    let mut record = format!("w{writer}-{seq}").into_bytes();
    record.resize(record.len() + padding, b'.');
    record
}

/// Splits a tagged record back into writer and sequence number.
pub fn parse_tagged(record: &[u8]) -> Option<(usize, usize)> {
    let text = std::str::from_utf8(record).ok()?;
    let tag = text.trim_end_matches('.');
    let (writer, seq) = tag.strip_prefix('w')?.split_once('-')?;
    Some((writer.parse().ok()?, seq.parse().ok()?))
}

/// Writes from `config.threads` threads at once.
pub fn run_concurrent_writers(channel: &Arc<Channel>, config: &StressConfig) -> StressResult {
    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|writer| {
            let channel = Arc::clone(channel);
            let config = config.clone();
            thread::spawn(move || {
                let mut ok = 0usize;
                for seq in 0..config.records_per_thread {
                    if channel
                        .write(&tagged_record(writer, seq, config.padding))
                        .is_ok()
                    {
                        ok += 1;
                    }
                }
                ok
            })
        })
        .collect();

    let successful_ops = handles
        .into_iter()
        .map(|handle| handle.join().expect("writer thread panicked"))
        .sum();
    let total_ops = config.threads * config.records_per_thread;
    StressResult {
        total_ops,
        successful_ops,
        failed_ops: total_ops - successful_ops,
        duration: start.elapsed(),
    }
}

/// Checks that every writer's records appear exactly once and in order.
/// Returns the number of records per writer.
pub fn verify_writer_order(records: &[Vec<u8>]) -> Result<HashMap<usize, usize>, String> {
    let mut next: HashMap<usize, usize> = HashMap::new();
    for record in records {
        let (writer, seq) = parse_tagged(record)
            .ok_or_else(|| format!("untagged record {:?}", String::from_utf8_lossy(record)))?;
        let expected = next.entry(writer).or_insert(0);
        if seq != *expected {
            return Err(format!("writer {writer}: expected {expected}, got {seq}"));
        }
        *expected += 1;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_records_parse_back() {
        let record = tagged_record(3, 42, 5);
        assert_eq!(record, b"w3-42.....".to_vec());
        assert_eq!(parse_tagged(&record), Some((3, 42)));
        assert_eq!(parse_tagged(b"garbage"), None);
    }

    #[test]
    fn order_check_rejects_gaps() {
        let good = vec![tagged_record(0, 0, 0), tagged_record(1, 0, 0), tagged_record(0, 1, 0)];
        let counts = verify_writer_order(&good).unwrap();
        assert_eq!(counts[&0], 2);
        assert_eq!(counts[&1], 1);

        let bad = vec![tagged_record(0, 0, 0), tagged_record(0, 2, 0)];
        assert!(verify_writer_order(&bad).is_err());
    }
}
