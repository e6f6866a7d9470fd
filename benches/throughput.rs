//! Throughput benchmarks for the atomic cell operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ortak::{AtomicShared, Shared};
use std::sync::atomic::Ordering;

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    let cell = AtomicShared::new(Shared::new(42u64));

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            let seen = cell.load(Ordering::Acquire);
            black_box(&seen);
        });
    });

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    let cell = AtomicShared::new(Shared::new(0u64));

    group.bench_function("fresh_handle", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            cell.store(Shared::new(black_box(i)), Ordering::Release);
        });
    });

    group.finish();
}

fn bench_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("swap");
    let cell = AtomicShared::new(Shared::new(0u64));

    group.bench_function("recycled_handle", |b| {
        let mut local = Shared::new(1u64);
        b.iter(|| {
            local = cell.swap(local, Ordering::AcqRel);
            black_box(&local);
        });
    });

    group.finish();
}

fn bench_compare_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("compare_exchange");
    let cell = AtomicShared::new(Shared::new(0u64));

    group.bench_function("uncontended_hit", |b| {
        b.iter(|| {
            let mut expected = cell.load(Ordering::Acquire);
            let desired = cell.load(Ordering::Acquire);
            let _ = black_box(cell.compare_exchange(
                &mut expected,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ));
        });
    });

    group.finish();
}

fn bench_handle_clone(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_clone");

    for clones in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*clones as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clones), clones, |b, &n| {
            let s = Shared::new(7u64);
            b.iter(|| {
                for _ in 0..n {
                    black_box(s.clone());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_load,
    bench_store,
    bench_swap,
    bench_compare_exchange,
    bench_handle_clone
);
criterion_main!(benches);
