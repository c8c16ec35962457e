//! # Task System Benchmarks
//!
//! 1. Fan-out - one summing task split across every worker
//! 2. Partial progress - the same sum in small chunks, requeued each turn
//! 3. Main pump - slices run inline on the calling thread

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_core::MultiPoolSettings;
use ember_tasks::{
    Task, TaskPriority, TaskStreamAffinity, TaskSystem, TaskSystemConfig, MAIN_STREAM,
};

const RANGE: usize = 1_000_000;

fn system() -> TaskSystem {
    TaskSystem::new(TaskSystemConfig {
        stream_allocator: MultiPoolSettings {
            use_config_cache: false,
            ..MultiPoolSettings::default()
        },
        ..TaskSystemConfig::default()
    })
    .unwrap()
}

fn summing_task(chunk: usize) -> (Task, Arc<AtomicU64>) {
    let total = Arc::new(AtomicU64::new(0));
    let inner = Arc::clone(&total);
    let task = Task::new("bench::sum", move |start: usize, end: usize| {
        let stop = end.min(start + chunk);
        inner.fetch_add((start as u64..stop as u64).sum(), Ordering::Relaxed);
        stop - start
    });
    (task, total)
}

fn bench_fan_out(c: &mut Criterion) {
    let system = system();
    let slices = system.worker_count() * 4;

    c.bench_function("fan_out_sum_1M", |b| {
        b.iter(|| {
            let (task, total) = summing_task(RANGE);
            task.start(&system, 0..RANGE, slices, TaskPriority::Normal);
            task.wait();
            black_box(total.load(Ordering::Relaxed))
        });
    });
}

fn bench_partial_progress(c: &mut Criterion) {
    let system = system();
    let slices = system.worker_count();

    c.bench_function("partial_progress_sum_1M_chunk_4K", |b| {
        b.iter(|| {
            let (task, total) = summing_task(4_096);
            task.start(&system, 0..RANGE, slices, TaskPriority::Normal);
            task.busy_wait();
            black_box(total.load(Ordering::Relaxed))
        });
    });
}

fn bench_main_pump(c: &mut Criterion) {
    let system = system();

    c.bench_function("main_pump_64_slices", |b| {
        b.iter(|| {
            let (task, total) = summing_task(RANGE);
            task.set_affinity(TaskStreamAffinity::only(MAIN_STREAM));
            task.start(&system, 0..RANGE / 16, 64, TaskPriority::High);
            system.run_main_until_done(&task);
            black_box(total.load(Ordering::Relaxed))
        });
    });
}

criterion_group!(benches, bench_fan_out, bench_partial_progress, bench_main_pump);
criterion_main!(benches);
