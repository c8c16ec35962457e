//! # Task Streams
//!
//! A stream is one execution context: a priority queue of ranged tasks, a
//! condition variable to sleep on, and (on its own thread) a private
//! multi-pool allocator that every slice runs under.
//!
//! ## Run Loop
//!
//! ```text
//!   drop stale heads ─> merge deferred ─> pop best ─┬─> run under scope ─> defer if unfinished
//!                                                   │
//!                             shared queue (affinity) ┘  else wait (bounded)
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use ember_core::memory::{AllocationScope, AllocatorHandle};
use ember_core::{MemoryError, MultiPoolAllocator, MultiPoolSettings};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::affinity::{IO_STREAM, MAIN_STREAM};
use crate::ranged::RangedTask;
use crate::system::SystemShared;

/// Role of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Index 0, driven by the host thread.
    Main,
    /// Index 1, reserved for blocking IO.
    Io,
    /// Generic compute stream.
    Worker,
}

impl StreamKind {
    /// Role of the stream at `index`.
    #[must_use]
    pub const fn for_index(index: usize) -> Self {
        match index {
            MAIN_STREAM => Self::Main,
            IO_STREAM => Self::Io,
            _ => Self::Worker,
        }
    }
}

/// Execution counters of one stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    executed: AtomicU64,
    requeued: AtomicU64,
    slow: AtomicU64,
    completed: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    /// Runnable invocations.
    pub executed: u64,
    /// Slices deferred for another turn.
    pub requeued: u64,
    /// Runs above the slow-task threshold.
    pub slow: u64,
    /// Slices finished on this stream.
    pub completed: u64,
}

impl StreamStats {
    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Heap entry: higher priority first, then first-in first-out.
struct QueuedTask {
    seq: u64,
    task: RangedTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority()
            .cmp(&other.task.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct StreamQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    // Set once at shutdown; pushes are refused from then on.
    closed: bool,
}

impl StreamQueue {
    fn push(&mut self, task: RangedTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask { seq, task });
    }

    fn pop(&mut self) -> Option<RangedTask> {
        self.heap.pop().map(|queued| queued.task)
    }

    /// Finishes and drops stale heads. Returns how many were dropped.
    fn discard_stale_heads(&mut self) -> usize {
        let mut dropped = 0;
        while self.heap.peek().is_some_and(|head| head.task.is_stale()) {
            if let Some(mut stale) = self.pop() {
                stale.finish();
                dropped += 1;
            }
        }
        dropped
    }
}

/// One stream's queue and wake-up signal.
pub struct TaskStream {
    index: usize,
    kind: StreamKind,
    name: String,
    queue: Mutex<StreamQueue>,
    wake: Condvar,
    stats: StreamStats,
}

impl TaskStream {
    pub(crate) fn new(index: usize) -> Self {
        let kind = StreamKind::for_index(index);
        let name = match kind {
            StreamKind::Main => "Main".to_owned(),
            StreamKind::Io => "IO".to_owned(),
            StreamKind::Worker => format!("Worker {index}"),
        };
        Self {
            index,
            kind,
            name,
            queue: Mutex::new(StreamQueue::default()),
            wake: Condvar::new(),
            stats: StreamStats::default(),
        }
    }

    /// Stream index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Stream role.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Stream name ("Main", "IO", "Worker 2", ...).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slices waiting in this stream's own queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Execution counters.
    #[must_use]
    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Queues `task` and wakes the stream. Hands the slice back once the
    /// stream is closed.
    pub(crate) fn push(&self, task: RangedTask) -> Result<(), RangedTask> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(task);
        }
        queue.push(task);
        drop(queue);
        self.wake.notify_one();
        Ok(())
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_all();
    }

    /// Refuses further pushes and empties the queue. The dropped slices
    /// report as abandoned; returns how many there were.
    pub(crate) fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut queue = self.queue.lock();
            queue.closed = true;
            queue.heap.drain().collect()
        };
        drained.len()
    }
}

impl std::fmt::Debug for TaskStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStream")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// The side of a stream that actually runs work.
///
/// Lives on the stream's thread (or, for Main, behind the system's mutex).
pub(crate) struct StreamWorker {
    shared: Arc<SystemShared>,
    index: usize,
    allocator: AllocatorHandle,
    deferred: Vec<RangedTask>,
}

impl StreamWorker {
    pub(crate) fn new(shared: Arc<SystemShared>, index: usize, allocator: AllocatorHandle) -> Self {
        Self {
            shared,
            index,
            allocator,
            deferred: Vec::new(),
        }
    }

    fn stream(&self) -> &TaskStream {
        &self.shared.streams[self.index]
    }

    /// One iteration of the run loop. Returns true if a slice ran.
    ///
    /// With `block` set an idle stream sleeps on its condvar for at most
    /// the configured idle wait.
    pub(crate) fn tick(&mut self, block: bool) -> bool {
        let stream = &self.shared.streams[self.index];
        let mut orphaned = Vec::new();
        let next = {
            let mut queue = stream.queue.lock();
            queue.discard_stale_heads();
            if queue.closed {
                orphaned.append(&mut self.deferred);
            } else {
                for task in self.deferred.drain(..) {
                    queue.push(task);
                }
            }
            queue.pop()
        };
        // Reported abandoned outside the queue lock.
        drop(orphaned);

        let Some(mut task) = next.or_else(|| self.shared.dequeue(self.index)) else {
            if block {
                let mut queue = stream.queue.lock();
                if queue.heap.is_empty() && self.shared.is_running() {
                    stream.wake.wait_for(&mut queue, self.shared.config.idle_wait());
                }
            }
            return false;
        };

        self.execute(&mut task);
        if !task.has_finished() {
            stream.stats.requeued.fetch_add(1, Ordering::Relaxed);
            self.deferred.push(task);
        }
        true
    }

    fn execute(&self, task: &mut RangedTask) {
        let stream = self.stream();
        let _scope = AllocationScope::new(self.allocator);
        let started = Instant::now();
        let finished = task.run();
        let elapsed = started.elapsed();

        stream.stats.executed.fetch_add(1, Ordering::Relaxed);
        if finished {
            stream.stats.completed.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed > self.shared.config.slow_task_threshold() {
            stream.stats.slow.fetch_add(1, Ordering::Relaxed);
            warn!(
                stream = %stream.name,
                task = %task.task().name(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.shared.config.slow_task_threshold_ms,
                "slow task"
            );
        }
    }

    /// Drops deferred slices. Returns how many were discarded.
    pub(crate) fn discard_deferred(&mut self) -> usize {
        let discarded = self.deferred.len();
        self.deferred.clear();
        discarded
    }
}

/// Body of every Worker and IO thread.
///
/// The stream allocator is created here so it is owned by this thread, and
/// its scope stays active for the thread's lifetime. Readiness (or the
/// reason for failing) goes back over `ready`.
pub(crate) fn run_stream_thread(
    shared: Arc<SystemShared>,
    index: usize,
    settings: MultiPoolSettings,
    ready: Sender<Result<(), MemoryError>>,
) {
    let name = shared.streams[index].name.clone();
    let allocator = match MultiPoolAllocator::new(format!("{name} Stream"), settings) {
        Ok(allocator) => allocator,
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };
    let _scope = allocator.scope();
    let mut worker = StreamWorker::new(shared, index, allocator.handle());

    if ready.send(Ok(())).is_err() {
        return;
    }
    drop(ready);
    debug!(stream = %name, allocator = %allocator.handle(), "stream started");

    while worker.shared.is_running() {
        worker.tick(true);
    }

    let discarded = worker.discard_deferred();
    debug!(stream = %name, discarded, "stream stopped");
}
