//! Insert and lookup benchmarks for the core tree + cache path.
//!
//! Everything runs against `MemPager`, so the numbers measure the page
//! codec, the cache, and split propagation rather than disk.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wrendb::storage::{CacheConfig, MemPager, PageCache};
use wrendb::BPlusTree;

const PAGE_SIZE: usize = 4096;

fn fresh_tree() -> BPlusTree<MemPager> {
    let pager = MemPager::new(PAGE_SIZE).unwrap();
    let cache = PageCache::new(CacheConfig::with_page_size(PAGE_SIZE)).unwrap();
    BPlusTree::create(pager, cache).unwrap()
}

fn shuffled(n: u32) -> Vec<u32> {
    let mut keys: Vec<u32> = (1..=n).collect();
    let mut state = 0x2545F491u32;
    for i in (1..keys.len()).rev() {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        keys.swap(i, (state as usize) % (i + 1));
    }
    keys
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");

    for &count in &[1_000u32, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("sequential", count), &count, |b, &count| {
            b.iter_with_setup(fresh_tree, |mut tree| {
                for key in 1..=count {
                    tree.insert(key, key).unwrap();
                }
                tree
            });
        });

        group.bench_with_input(BenchmarkId::new("random", count), &count, |b, &count| {
            b.iter_with_setup(
                || (fresh_tree(), shuffled(count)),
                |(mut tree, keys)| {
                    for key in keys {
                        tree.insert(key, key).unwrap();
                    }
                    tree
                },
            );
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_search");

    let count = 10_000u32;
    let mut tree = fresh_tree();
    for key in 1..=count {
        tree.insert(key, key * 3).unwrap();
    }

    group.throughput(Throughput::Elements(1));
    group.bench_function("cached_point_lookup", |b| {
        let mut key = 1u32;
        b.iter(|| {
            key = key % count + 1;
            black_box(tree.search(black_box(key)).unwrap())
        });
    });

    group.bench_function("cached_payload_read", |b| {
        let mut key = 1u32;
        b.iter(|| {
            key = key % count + 1;
            black_box(tree.payload(black_box(key)).unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_search);
criterion_main!(benches);
