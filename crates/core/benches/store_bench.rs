//! Put/get throughput for the blob store

use std::io::Read;

use blobs_core::{BlobRef, BlobStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");
    for size in [1024usize, 1024 * 1024] {
        let data = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| BlobRef::digest(black_box(data)))
        });
    }
    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();

    let mut group = c.benchmark_group("store");
    for size in [4 * 1024usize, 1024 * 1024] {
        let data = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        // Identical content after the first iteration exercises the dedup path
        group.bench_with_input(BenchmarkId::new("put", size), &data, |b, data| {
            b.iter(|| store.put(&data[..]).unwrap())
        });

        let blob = store.put(&data[..]).unwrap();
        group.bench_with_input(BenchmarkId::new("get", size), &blob, |b, blob| {
            b.iter(|| {
                let mut out = Vec::with_capacity(size);
                store.get(blob).unwrap().read_to_end(&mut out).unwrap();
                black_box(out)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hash, bench_store);
criterion_main!(benches);
