//! zonekv - Performance Benchmarks
//! Measures throughput of core engine operations using Criterion.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use zonekv::engine::memtable::MemTable;
use zonekv::engine::sstable::bloom::BloomFilter;
use zonekv::engine::wal::LogWriter;
use zonekv::types::{InternalKey, ValueKind, ValueRecord, MAX_SEQUENCE};
use zonekv::zoned::{FileId, MemoryZonedDevice, ZonedStore};
use zonekv::{Config, WriteBatch, ZoneKv};

fn filled_memtable(count: u64) -> MemTable {
    let table = MemTable::new(32 * 1024);
    for i in 0..count {
        let key = format!("key_{:06}", i).into_bytes();
        let value = format!("value_{:06}", i).into_bytes();
        table.insert(InternalKey::new(key, i + 1, ValueKind::Put), ValueRecord::Inline(value));
    }
    table
}

fn bench_memtable_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("memtable");

    group.bench_function("insert_1000", |b| {
        b.iter(|| black_box(filled_memtable(1000)));
    });

    group.bench_function("get_hit", |b| {
        let table = filled_memtable(1000);
        b.iter(|| black_box(table.get(b"key_000500", MAX_SEQUENCE)));
    });

    group.bench_function("get_miss", |b| {
        let table = filled_memtable(1000);
        b.iter(|| black_box(table.get(b"nonexistent_key", MAX_SEQUENCE)));
    });

    group.finish();
}

fn bench_bloom_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("bloom_filter");

    group.bench_function("insert_1000", |b| {
        b.iter(|| {
            let mut bf = BloomFilter::new(1000, 10);
            for i in 0..1000 {
                let key = format!("key_{:06}", i);
                bf.insert(black_box(key.as_bytes()));
            }
        });
    });

    group.bench_function("lookup_hit", |b| {
        let mut bf = BloomFilter::new(1000, 10);
        for i in 0..1000 {
            let key = format!("key_{:06}", i);
            bf.insert(key.as_bytes());
        }
        b.iter(|| black_box(bf.may_contain(b"key_000500")));
    });

    group.bench_function("lookup_miss", |b| {
        let mut bf = BloomFilter::new(1000, 10);
        for i in 0..1000 {
            let key = format!("key_{:06}", i);
            bf.insert(key.as_bytes());
        }
        b.iter(|| black_box(bf.may_contain(b"definitely_not_here")));
    });

    group.finish();
}

fn bench_wal_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal");

    group.bench_function("append_100", |b| {
        let device = MemoryZonedDevice::new(64 * 1024 * 1024, 16);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        let mut log = LogWriter::create(Arc::clone(&store), FileId::log(1)).unwrap();
        let mut number = 1;

        b.iter(|| {
            // Keep the log inside one zone.
            if log.size().unwrap() > 32 * 1024 * 1024 {
                number += 1;
                log = LogWriter::create(Arc::clone(&store), FileId::log(number)).unwrap();
            }
            for i in 0..100 {
                let mut batch = WriteBatch::new();
                batch.put(format!("key_{:06}", i), format!("value_{:06}", i));
                log.add_record(black_box(&batch.encode())).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_engine_e2e(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_e2e");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("put_get_cycle", size), size, |b, &size| {
            b.iter(|| {
                let device = MemoryZonedDevice::new(1024 * 1024, 64);
                let config = Config::small("unused");
                let db = ZoneKv::open_with_device(config, Arc::new(device)).unwrap();

                for i in 0..size {
                    db.put(format!("key_{:06}", i), format!("value_{:06}", i), false)
                        .unwrap();
                }
                for i in 0..size {
                    let key = format!("key_{:06}", i);
                    black_box(db.get(key.as_bytes()).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_memtable_operations,
    bench_bloom_filter,
    bench_wal_operations,
    bench_engine_e2e
);
criterion_main!(benches);
