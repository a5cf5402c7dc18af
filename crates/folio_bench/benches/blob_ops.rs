//! Blob operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use folio_bench::{populate, random_data, temp_store};

const SIZES: [usize; 4] = [64, 1024, 16 * 1024, 256 * 1024];

/// Benchmark blob creation.
fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (_dir, store) = temp_store();
            let data = random_data(size);
            b.iter(|| {
                let blob = store.create(b"bench", black_box(&data)).unwrap();
                // keep the handle table from growing without bound
                store.delete(&blob).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark blob reads.
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (_dir, store) = temp_store();
            let blobs = populate(&store, 64, size);
            let mut i = 0;
            b.iter(|| {
                let data = store.read(&blobs[i % blobs.len()]).unwrap();
                i += 1;
                black_box(data);
            });
        });
    }
    group.finish();
}

/// Benchmark payload rewrites (page relocation plus index update).
fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (_dir, store) = temp_store();
            let blob = store.create(b"", &random_data(size)).unwrap();
            let data = random_data(size);
            b.iter(|| {
                store
                    .write(&blob, None, Some(black_box(&data)), Some(blob.version()))
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark small appends, which stay in place until the page fills.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for chunk in [16usize, 256] {
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            let (_dir, store) = temp_store();
            let data = random_data(chunk);
            let mut blob = store.create(b"", b"").unwrap();
            b.iter(|| {
                if blob.size().unwrap_or(0) as usize + chunk > 64 * 1024 {
                    store.delete(&blob).unwrap();
                    blob = store.create(b"", b"").unwrap();
                }
                store.append(&blob, None, black_box(&data)).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_create, bench_read, bench_write, bench_append);
criterion_main!(benches);
