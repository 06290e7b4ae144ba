//! Record format benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidelog_bench::{random_data, text_data};
use tidelog_format::{
    compressor_for, find_marker, scan_records, CompressMode, RecordEncoder, SYNC_MARKER,
};

/// Benchmark envelope encoding per compression mode.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        for (label, mode) in [("none", CompressMode::None), ("zlib", CompressMode::Zlib)] {
            group.bench_with_input(BenchmarkId::new(label, size), size, |b, &size| {
                let mut encoder = RecordEncoder::new(compressor_for(mode), None);
                let record = text_data(size);

                b.iter(|| black_box(encoder.encode(black_box(&record)).unwrap()));
            });
        }
    }

    group.finish();
}

/// Benchmark sync-marker search over marker-free data.
fn bench_find_marker(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_marker");

    for size in [4096, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut data: Vec<u8> = random_data(size)
                .into_iter()
                .map(|byte| if byte == SYNC_MARKER[0] { 0 } else { byte })
                .collect();
            data.extend_from_slice(&SYNC_MARKER);

            b.iter(|| black_box(find_marker(black_box(&data), 0)));
        });
    }

    group.finish();
}

/// Benchmark the cache-file recovery scan.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_records");

    for count in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let mut encoder = RecordEncoder::new(compressor_for(CompressMode::None), None);
            let record = text_data(200);
            let mut data = Vec::new();
            for _ in 0..count {
                data.extend(encoder.encode(&record).unwrap());
            }
            data.resize(data.len() + 4096, 0);

            b.iter(|| black_box(scan_records(black_box(&data), 0)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_find_marker, bench_scan);
criterion_main!(benches);
