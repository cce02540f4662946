//! Varint and id-set benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dirload_bench::utils::generate_ids;
use dirload_core::packed::{read_packed, write_packed};
use dirload_core::{EntryId, ImportIdSet};

/// Benchmark delta-encoding sorted ids as varints.
fn bench_packed_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("packed_write");

    for count in [100usize, 10_000].iter() {
        let ids = generate_ids(*count);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &ids, |b, ids| {
            let mut out = Vec::with_capacity(ids.len() * 2);
            b.iter(|| {
                out.clear();
                let mut previous = 0;
                for &id in ids {
                    write_packed(&mut out, id - previous);
                    previous = id;
                }
                black_box(out.len());
            });
        });
    }

    group.finish();
}

/// Benchmark decoding a run of varints.
fn bench_packed_read(c: &mut Criterion) {
    let ids = generate_ids(10_000);
    let mut encoded = Vec::new();
    for &id in &ids {
        write_packed(&mut encoded, id);
    }

    c.bench_function("packed_read_10000", |b| {
        b.iter(|| {
            let mut pos = 0;
            let mut sum = 0u64;
            while let Some((value, used)) = read_packed(&encoded[pos..]).unwrap() {
                sum = sum.wrapping_add(value);
                pos += used;
            }
            black_box(sum);
        });
    });
}

/// Benchmark merging id sets below and above the entry limit.
fn bench_id_set_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_set_merge");

    for limit in [0usize, 4000].iter() {
        let left = generate_ids(2_000);
        let right = generate_ids(3_000);
        group.bench_with_input(BenchmarkId::from_parameter(limit), limit, |b, &limit| {
            b.iter(|| {
                let mut a = ImportIdSet::new(limit, true);
                let mut other = ImportIdSet::new(limit, true);
                left.iter().for_each(|&id| a.add(EntryId::new(id)));
                right.iter().for_each(|&id| other.add(EntryId::new(id)));
                a.merge(&other);
                black_box(a.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_packed_write, bench_packed_read, bench_id_set_merge);
criterion_main!(benches);
