//! Benchmark utilities.

use rand::Rng;
use tempfile::TempDir;
use tidelog_core::{Channel, ChannelConfig, CompressMode};

/// Random bytes of the given size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Log-line-like bytes of the given size: printable and repetitive enough
/// for deflate to matter.
pub fn text_data(size: usize) -> Vec<u8> {
    let line = b"2024-01-01 12:00:00.000 INFO request served path=/api/v1/items status=200 ";
    line.iter().copied().cycle().take(size).collect()
}

/// Opens a channel in a fresh temporary directory.
pub fn bench_channel(name: &str, async_write: bool, compress: CompressMode) -> (TempDir, Channel) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let config = ChannelConfig::new(name, dir.path())
        .async_write(async_write)
        .compress_mode(compress);
    let channel = Channel::open(config).expect("Failed to open channel");
    (dir, channel)
}
