//! Pool benchmarks
//!
//! Bump allocation against the instrumented backend and the system heap,
//! plus the create/destroy cycle that recycling is meant to make cheap.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use nebula_region::{Allocator, Pool, PoolConfig, PoolMode, pformat};
use std::alloc::Layout;
use std::hint::black_box;

fn root(mode: PoolMode) -> Pool {
    Pool::new_root(
        Some(Allocator::new()),
        None,
        PoolConfig::production().with_mode(mode),
    )
    .unwrap()
}

/// Benchmark batches of small allocations followed by a clear
fn bench_allocate_and_clear(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_and_clear");
    group.throughput(Throughput::Elements(1000));

    for mode in [PoolMode::Bump, PoolMode::Debug] {
        group.bench_function(BenchmarkId::new("pool_1000x64b", mode), |b| {
            let pool = root(mode);
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(pool.allocate(64).unwrap());
                }
                pool.clear().unwrap();
            });
        });
    }

    // System allocator (baseline)
    group.bench_function("system_1000x64b", |b| {
        let layout = Layout::from_size_align(64, 8).unwrap();
        b.iter(|| unsafe {
            let mut ptrs = Vec::with_capacity(1000);
            for _ in 0..1000 {
                ptrs.push(std::alloc::alloc(layout));
            }
            for ptr in ptrs {
                std::alloc::dealloc(black_box(ptr), layout);
            }
        });
    });

    group.finish();
}

/// Benchmark child pool creation and teardown on a shared allocator
fn bench_child_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("child_lifecycle");

    for depth in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("create_destroy", depth), &depth, |b, &depth| {
            let parent = root(PoolMode::Bump);
            b.iter(|| {
                let top = parent.create_child().unwrap();
                let mut current = top.clone();
                for _ in 1..depth {
                    current = current.create_child().unwrap();
                }
                black_box(current.allocate(128).unwrap());
                top.destroy().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark formatting into pool memory against `format!`
fn bench_format(c: &mut Criterion) {
    let mut group = c.benchmark_group("format");

    group.bench_function("pformat_short", |b| {
        let pool = root(PoolMode::Bump);
        b.iter(|| {
            for i in 0..100 {
                black_box(pformat!(pool, "node-{i}:{}", "ready").unwrap());
            }
            pool.clear().unwrap();
        });
    });

    group.bench_function("pformat_16k", |b| {
        let pool = root(PoolMode::Bump);
        let body = "x".repeat(16 * 1024);
        b.iter(|| {
            black_box(pformat!(pool, "{body}").unwrap());
            pool.clear().unwrap();
        });
    });

    group.bench_function("std_format_short", |b| {
        b.iter(|| {
            for i in 0..100 {
                black_box(format!("node-{i}:{}", "ready"));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_and_clear,
    bench_child_lifecycle,
    bench_format
);
criterion_main!(benches);
