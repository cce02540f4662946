//! End-to-end import benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dirload_bench::utils::{bench_root, generate_people};
use dirload_core::{ImportConfig, Importer, MemorySource};
use std::sync::Arc;
use tempfile::TempDir;

fn config() -> ImportConfig {
    ImportConfig::new()
        .thread_count(4)
        .available_memory(128 * 1024 * 1024)
        .progress_interval(None)
}

/// Benchmark imports with in-memory scratch space.
fn bench_import_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("import_memory");
    group.sample_size(10);

    for count in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let entries = generate_people(count, true);
            b.iter(|| {
                let source = Arc::new(MemorySource::new(entries.clone()));
                let report = Importer::new(config(), bench_root()).import(source).unwrap();
                assert_eq!(report.progress.imported, count as u64 + 2);
            });
        });
    }

    group.finish();
}

/// Benchmark imports spilling scratch files to disk.
fn bench_import_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("import_file");
    group.sample_size(10);

    for count in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let entries = generate_people(count, false);
            let temp_dir = TempDir::new().unwrap();
            b.iter(|| {
                let source = Arc::new(MemorySource::new(entries.clone()));
                let config = config().scratch_dir(temp_dir.path());
                let report = Importer::new(config, bench_root()).import(source).unwrap();
                assert!(report.is_completed());
            });
        });
    }

    group.finish();
}

/// Benchmark append imports without DN validation.
fn bench_import_trusted(c: &mut Criterion) {
    let count = 10_000usize;
    let entries = generate_people(count, false);
    let mut group = c.benchmark_group("import_trusted");
    group.sample_size(10);
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("skip_dn_validation", |b| {
        b.iter(|| {
            let source = Arc::new(MemorySource::new(entries.clone()));
            let config = config().skip_dn_validation(true);
            Importer::new(config, bench_root()).import(source).unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_import_memory, bench_import_file, bench_import_trusted);
criterion_main!(benches);
