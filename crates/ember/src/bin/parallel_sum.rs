//! # Parallel Sum
//!
//! Sums `1..=10,000,000` once per worker count, restricting each run to the
//! first N worker streams, and checks every result against the closed form.
//!
//! ```text
//! RUST_LOG=debug cargo run --release --bin parallel_sum -- [ember.toml]
//! ```

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ember::tasks::{Task, TaskPriority, TaskStreamAffinity, IO_STREAM, MAIN_STREAM};
use ember::{EngineConfig, EngineResult, Runtime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const END: u64 = 10_000_000;
const EXPECTED: u64 = END * (END + 1) / 2;
/// Indices summed per runnable call before yielding back to the stream.
const CHUNK: usize = 65_536;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "parallel_sum failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> EngineResult<bool> {
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let runtime = Runtime::start(config)?;
    let system = runtime.tasks();
    let mut all_correct = true;

    for workers in 1..=system.worker_count() {
        let mut affinity = TaskStreamAffinity::all();
        affinity.unset(MAIN_STREAM);
        affinity.unset(IO_STREAM);
        for stream in (2 + workers)..system.stream_count() {
            affinity.unset(stream);
        }

        let total = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&total);
        let task = Task::new("Parallel Sum", move |start: usize, end: usize| {
            let stop = end.min(start + CHUNK);
            sink.fetch_add((start as u64..stop as u64).sum(), Ordering::Relaxed);
            stop - start
        });
        task.set_affinity(affinity);

        let started = Instant::now();
        task.start(system, 1..(END as usize + 1), workers * 4, TaskPriority::Normal);
        task.wait();
        let elapsed = started.elapsed();

        let sum = total.load(Ordering::Relaxed);
        let correct = sum == EXPECTED;
        all_correct &= correct;
        info!(
            workers,
            sum,
            correct,
            elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
            "parallel sum"
        );
    }

    runtime.shutdown()?;
    Ok(all_correct)
}
