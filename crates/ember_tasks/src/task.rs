//! # Tasks
//!
//! A [`Task`] is one logical job: a name, a [`Runnable`] and the counters
//! that tell its owner when every slice has been processed.
//!
//! ## Partial Progress
//!
//! A runnable is called with the remaining `[start, end)` of its slice and
//! returns how many indices it actually processed. Returning less than the
//! whole range is fine: the stream re-queues the slice and calls again on a
//! later turn instead of blocking on it.
//!
//! ```rust,ignore
//! let task = Task::new("Sum", move |start, end| {
//!     let chunk_end = end.min(start + 4096);
//!     total.fetch_add((start..chunk_end).sum::<usize>(), Ordering::Relaxed);
//!     chunk_end - start
//! });
//! task.start(&system, 0..1_000_000, 16, TaskPriority::Normal);
//! task.wait();
//! ```

use std::fmt;
use std::hint;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::error;

use crate::affinity::TaskStreamAffinity;
use crate::ranged::RangedTask;
use crate::system::TaskSystem;

/// Sleep step of [`Task::wait`].
const WAIT_STEP: Duration = Duration::from_micros(100);

/// The work behind a task.
pub trait Runnable: Send + Sync {
    /// Processes indices starting at `start`, never past `end`.
    ///
    /// Returns the number of indices processed.
    fn run(&self, start: usize, end: usize) -> usize;
}

impl<F> Runnable for F
where
    F: Fn(usize, usize) -> usize + Send + Sync,
{
    #[inline]
    fn run(&self, start: usize, end: usize) -> usize {
        self(start, end)
    }
}

/// Scheduling priority of a ranged task inside one stream's queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Regular work.
    #[default]
    Normal,
    /// Runs before normal work.
    High,
    /// Runs before everything else.
    Critical,
}

/// Progress counters of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskProgress {
    /// Slices emitted by `start`.
    pub total_slices: usize,
    /// Slices that reported completion.
    pub finished_slices: usize,
    /// Slices discarded at shutdown (included in `finished_slices`).
    pub abandoned_slices: usize,
    /// Indices the runnable reported as processed.
    pub processed_indices: u64,
}

struct TaskShared {
    name: String,
    runnable: Box<dyn Runnable>,
    total: AtomicUsize,
    finished: AtomicUsize,
    abandoned: AtomicUsize,
    processed: AtomicU64,
    cancelled: AtomicBool,
    affinity: AtomicU64,
}

/// Shared handle to one job.
///
/// Cloning is cheap; every [`RangedTask`] holds a clone.
#[derive(Clone)]
pub struct Task {
    shared: Arc<TaskShared>,
}

impl Task {
    /// Creates a task from a closure, with the compute affinity (no Main,
    /// no IO).
    pub fn new<F>(name: impl Into<String>, runnable: F) -> Self
    where
        F: Fn(usize, usize) -> usize + Send + Sync + 'static,
    {
        Self::with_runnable(name, runnable)
    }

    /// Creates a task from any [`Runnable`].
    pub fn with_runnable(name: impl Into<String>, runnable: impl Runnable + 'static) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                name: name.into(),
                runnable: Box::new(runnable),
                total: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                abandoned: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                affinity: AtomicU64::new(TaskStreamAffinity::compute().bits()),
            }),
        }
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Affinity given to slices emitted from now on.
    pub fn set_affinity(&self, affinity: TaskStreamAffinity) {
        self.shared.affinity.store(affinity.bits(), Ordering::Relaxed);
    }

    /// Current affinity.
    #[must_use]
    pub fn affinity(&self) -> TaskStreamAffinity {
        TaskStreamAffinity::from_bits(self.shared.affinity.load(Ordering::Relaxed))
    }

    /// Splits `range` into `sub_tasks` slices and hands them to the shared
    /// queue.
    ///
    /// Returns the number of slices emitted.
    pub fn start(
        &self,
        system: &TaskSystem,
        range: Range<usize>,
        sub_tasks: usize,
        priority: TaskPriority,
    ) -> usize {
        let slices = self.publish(range, sub_tasks, priority);
        let emitted = slices.len();
        for slice in slices {
            system.enqueue(slice);
        }
        emitted
    }

    /// Like [`Task::start`] but queues every slice on one stream.
    ///
    /// An out-of-range stream is logged and nothing is emitted.
    pub fn start_on(
        &self,
        system: &TaskSystem,
        stream: usize,
        range: Range<usize>,
        sub_tasks: usize,
        priority: TaskPriority,
    ) -> usize {
        if stream >= system.stream_count() {
            error!(
                task = %self.shared.name,
                stream,
                streams = system.stream_count(),
                "cannot start task on a stream that does not exist"
            );
            return 0;
        }
        let slices = self.publish(range, sub_tasks, priority);
        let emitted = slices.len();
        for slice in slices {
            system.enqueue_to(stream, slice);
        }
        emitted
    }

    /// Builds the slices and publishes their count before anything runs.
    fn publish(
        &self,
        range: Range<usize>,
        sub_tasks: usize,
        priority: TaskPriority,
    ) -> Vec<RangedTask> {
        let ranges = partition(range, sub_tasks);
        self.shared.total.fetch_add(ranges.len(), Ordering::AcqRel);
        let affinity = self.affinity();
        ranges
            .into_iter()
            .map(|slice| RangedTask::new(self.clone(), slice, priority, affinity))
            .collect()
    }

    /// Returns true once every emitted slice reported completion.
    ///
    /// A task that was never started is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire) >= self.shared.total.load(Ordering::Acquire)
    }

    /// Sleeps in small steps until the task is done.
    pub fn wait(&self) {
        while !self.is_done() {
            thread::sleep(WAIT_STEP);
        }
    }

    /// Waits at most `timeout`. Returns true if the task is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_done() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_STEP);
        }
        true
    }

    /// Spins until the task is done.
    pub fn busy_wait(&self) {
        while !self.is_done() {
            hint::spin_loop();
        }
    }

    /// Stops the task: unfinished slices complete without running again.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Returns true after [`Task::cancel`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            total_slices: self.shared.total.load(Ordering::Acquire),
            finished_slices: self.shared.finished.load(Ordering::Acquire),
            abandoned_slices: self.shared.abandoned.load(Ordering::Relaxed),
            processed_indices: self.shared.processed.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn invoke(&self, start: usize, end: usize) -> usize {
        self.shared.runnable.run(start, end)
    }

    #[inline]
    pub(crate) fn record_processed(&self, count: usize) {
        self.shared.processed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Counts one finished slice. Called exactly once per slice.
    pub(crate) fn report_finished(&self, abandoned: bool) {
        if abandoned {
            self.shared.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.finished.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.shared.name)
            .field("progress", &self.progress())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Splits `range` into contiguous slices.
///
/// An empty range or fewer than two sub-tasks yields one slice. Otherwise
/// every slice is `ceil(len / sub_tasks)` long except the last, which is
/// clipped at `range.end`.
#[must_use]
pub fn partition(range: Range<usize>, sub_tasks: usize) -> Vec<Range<usize>> {
    let len = range.end.saturating_sub(range.start);
    if len == 0 || sub_tasks < 2 {
        return vec![range];
    }
    let interval = len.div_ceil(sub_tasks).max(1);
    (range.start..range.end)
        .step_by(interval)
        .map(|start| start..(start + interval).min(range.end))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(slices: &[Range<usize>], range: &Range<usize>) -> bool {
        slices.first().map(|s| s.start) == Some(range.start)
            && slices.last().map(|s| s.end) == Some(range.end)
            && slices.windows(2).all(|w| w[0].end == w[1].start)
            && slices.iter().all(|s| s.start < s.end)
    }

    #[test]
    fn test_partition_covers_range_exactly() {
        for len in 1..200 {
            for k in 1..40 {
                let range = 0..len;
                let slices = partition(range.clone(), k);
                assert!(covers(&slices, &range), "len {len} k {k}: {slices:?}");
                assert!(slices.len() <= k.max(1));
            }
        }
    }

    #[test]
    fn test_partition_single_slice_cases() {
        assert_eq!(partition(5..5, 8), vec![5..5]);
        assert_eq!(partition(0..100, 1), vec![0..100]);
        assert_eq!(partition(0..100, 0), vec![0..100]);
    }

    #[test]
    fn test_partition_more_sub_tasks_than_indices() {
        assert_eq!(partition(10..13, 8), vec![10..11, 11..12, 12..13]);
    }

    #[test]
    fn test_partition_last_slice_absorbs_remainder() {
        assert_eq!(partition(0..10, 3), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_unstarted_task_is_done() {
        let task = Task::new("idle", |start, end| end - start);
        assert!(task.is_done());
        assert!(task.wait_timeout(Duration::from_millis(1)));
        assert_eq!(task.progress(), TaskProgress::default());
    }

    #[test]
    fn test_cancel_flag() {
        let task = Task::new("cancel", |start, end| end - start);
        assert!(!task.is_cancelled());
        task.cancel();
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_default_affinity_is_compute() {
        let task = Task::new("affinity", |start, end| end - start);
        assert_eq!(task.affinity(), TaskStreamAffinity::compute());
        task.set_affinity(TaskStreamAffinity::only(3));
        assert!(task.affinity().get(3));
        assert!(!task.affinity().get(2));
    }

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }
}
