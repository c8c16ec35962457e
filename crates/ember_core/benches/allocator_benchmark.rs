//! # Allocator Benchmarks
//!
//! Compares the registered allocators against the system allocator on the
//! patterns they are built for:
//! 1. Stack - strictly nested scratch allocations
//! 2. Pool - fixed-size churn
//! 3. Multi-Pool - mixed small sizes
//! 4. Monotonic - bump-and-reset frames

#![allow(missing_docs)]
#![allow(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_core::memory::{
    registry, AllocatorHandle, MonotonicAllocator, MultiPoolAllocator, MultiPoolSettings,
    PoolAllocator, StackAllocator,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const OPS: usize = 1_000;

fn bench_system(c: &mut Criterion) {
    c.bench_function("system_alloc_free_1K", |b| {
        b.iter(|| {
            for _ in 0..OPS {
                let ptr = registry().allocate(AllocatorHandle::SYSTEM, 64).unwrap();
                unsafe { registry().deallocate(AllocatorHandle::SYSTEM, black_box(ptr), 64) };
            }
        });
    });
}

fn bench_stack(c: &mut Criterion) {
    let stack = StackAllocator::new("bench::stack", 1024 * 1024).unwrap();
    let mut live = Vec::with_capacity(OPS);

    c.bench_function("stack_nested_1K", |b| {
        b.iter(|| {
            for i in 0..OPS {
                live.push(stack.allocate(16 + i % 48).unwrap());
            }
            for i in (0..OPS).rev() {
                let ptr = live.pop().unwrap();
                unsafe { stack.deallocate(ptr, 16 + i % 48) };
            }
            black_box(stack.usage())
        });
    });
}

fn bench_pool(c: &mut Criterion) {
    let pool = PoolAllocator::new("bench::pool", 64, 4096).unwrap();

    c.bench_function("pool_churn_1K", |b| {
        b.iter(|| {
            for _ in 0..OPS {
                let ptr = pool.allocate(64).unwrap();
                unsafe { pool.deallocate(black_box(ptr), 64) };
            }
        });
    });
}

fn bench_multi_pool(c: &mut Criterion) {
    let settings = MultiPoolSettings {
        use_config_cache: false,
        ..MultiPoolSettings::default()
    };
    let multi = MultiPoolAllocator::new("bench::multi", settings).unwrap();
    let mut rng = StdRng::seed_from_u64(0xE4BE);
    let sizes: Vec<usize> = (0..OPS).map(|_| rng.gen_range(1..=512)).collect();
    let mut live = Vec::with_capacity(OPS);

    c.bench_function("multi_pool_mixed_1K", |b| {
        b.iter(|| {
            for &size in &sizes {
                live.push((multi.allocate(size).unwrap(), size));
            }
            for (ptr, size) in live.drain(..) {
                unsafe { multi.deallocate(ptr, size) };
            }
        });
    });
}

fn bench_monotonic(c: &mut Criterion) {
    let mono = MonotonicAllocator::new("bench::monotonic", 1024 * 1024).unwrap();
    let mut live = Vec::with_capacity(OPS);

    c.bench_function("monotonic_frame_1K", |b| {
        b.iter(|| {
            for _ in 0..OPS {
                live.push(mono.allocate(48).unwrap());
            }
            for ptr in live.drain(..) {
                unsafe { mono.deallocate(ptr, 48) };
            }
            black_box(mono.reset())
        });
    });
}

criterion_group!(
    benches,
    bench_system,
    bench_stack,
    bench_pool,
    bench_multi_pool,
    bench_monotonic
);
criterion_main!(benches);
