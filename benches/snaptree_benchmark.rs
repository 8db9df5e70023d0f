// The benchmarks aim to only measure the operations in their names, so all
// of them use Bencher::iter_batched with the map prepared outside the
// measured function. Insert counts are drawn at random from small ranges to
// avoid a single count lining up with HW-specific behaviour.

extern crate criterion;
extern crate rand;
extern crate snapread;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::seq::SliceRandom;
use rand::Rng;
use snapread::SnapTreeMap;

const INSERT_COUNT_MIN: usize = 900;
const INSERT_COUNT_MAX: usize = 1100;
const SEARCH_POOL: usize = 10_000;

fn prepare_keys() -> Vec<usize> {
    let mut rng = rand::rng();
    let count = rng.random_range(INSERT_COUNT_MIN..INSERT_COUNT_MAX);
    let mut keys: Vec<usize> = (0..count).collect();
    keys.shuffle(&mut rng);
    keys
}

fn prepare_filled() -> SnapTreeMap<usize, usize> {
    (0..SEARCH_POOL).map(|k| (k, k)).collect()
}

pub fn insert_shuffled(c: &mut Criterion) {
    c.bench_function("insert_shuffled", |b| {
        b.iter_batched(
            prepare_keys,
            |keys| {
                let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
                for k in keys {
                    map.insert(k, k);
                }
                map
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn search_hit(c: &mut Criterion) {
    let map = prepare_filled();
    c.bench_function("search_hit", |b| {
        b.iter_batched(
            || rand::rng().random_range(0..SEARCH_POOL),
            |k| black_box(map.get(&k)),
            BatchSize::SmallInput,
        )
    });
}

pub fn remove_shuffled(c: &mut Criterion) {
    c.bench_function("remove_shuffled", |b| {
        b.iter_batched(
            || {
                let keys = prepare_keys();
                let map: SnapTreeMap<usize, usize> =
                    keys.iter().map(|k| (*k, *k)).collect();
                (map, keys)
            },
            |(map, keys)| {
                for k in keys {
                    map.remove(&k);
                }
                map
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn clone_snapshot(c: &mut Criterion) {
    c.bench_function("clone_snapshot", |b| {
        b.iter_batched(
            prepare_filled,
            |map| {
                // One O(1) snapshot plus the first diverging writes.
                let snap = map.clone();
                map.insert(SEARCH_POOL + 1, 0);
                map.remove(&0);
                black_box(snap)
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn size_under_mutation(c: &mut Criterion) {
    c.bench_function("size_under_mutation", |b| {
        b.iter_batched(
            prepare_filled,
            |map| {
                map.insert(SEARCH_POOL + 1, 0);
                black_box(map.len())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    insert_shuffled,
    search_hit,
    remove_shuffled,
    clone_snapshot,
    size_under_mutation
);
criterion_main!(benches);
