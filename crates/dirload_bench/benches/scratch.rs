//! Scratch backend benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dirload_storage::{FileBackend, InMemoryBackend, ScratchBackend};
use tempfile::TempDir;

/// Create record-like data of given size.
fn record_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Benchmark appending flushed runs.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("scratch_append");

    for size in [4096usize, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        let data = record_data(*size);

        group.bench_with_input(BenchmarkId::new("memory", size), &data, |b, data| {
            let mut backend = InMemoryBackend::new();
            b.iter(|| black_box(backend.append(black_box(data)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("file", size), &data, |b, data| {
            let temp_dir = TempDir::new().unwrap();
            let mut backend = FileBackend::create(&temp_dir.path().join("run")).unwrap();
            b.iter(|| black_box(backend.append(black_box(data)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark reading a run back through read-ahead windows.
fn bench_window_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("scratch_window_read");
    let run = record_data(1 << 20);

    for window in [2048usize, 65536].iter() {
        group.throughput(Throughput::Bytes(run.len() as u64));
        group.bench_with_input(BenchmarkId::new("file", window), window, |b, &window| {
            let temp_dir = TempDir::new().unwrap();
            let mut backend = FileBackend::create(&temp_dir.path().join("run")).unwrap();
            backend.append(&run).unwrap();
            backend.flush().unwrap();
            let mut buf = vec![0u8; window];
            b.iter(|| {
                let mut offset = 0u64;
                loop {
                    let read = backend.read_into(offset, &mut buf).unwrap();
                    if read == 0 {
                        break;
                    }
                    offset += read as u64;
                }
                black_box(offset);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_window_read);
criterion_main!(benches);
