//! # Ranged Tasks
//!
//! One contiguous slice of a [`Task`] with a resumable cursor.

use std::ops::Range;

use tracing::warn;

use crate::affinity::TaskStreamAffinity;
use crate::task::{Task, TaskPriority};

/// A schedulable `[start, end)` slice of a task.
///
/// Reports completion to its task exactly once: when the cursor reaches
/// the end, when the task is cancelled, or (as abandoned) when the slice is
/// dropped unfinished.
pub struct RangedTask {
    task: Task,
    start: usize,
    end: usize,
    cursor: usize,
    priority: TaskPriority,
    affinity: TaskStreamAffinity,
    reported: bool,
}

impl RangedTask {
    /// Creates a slice. The caller is responsible for counting it in the
    /// task's total; [`Task::start`] does that.
    #[must_use]
    pub(crate) fn new(
        task: Task,
        range: Range<usize>,
        priority: TaskPriority,
        affinity: TaskStreamAffinity,
    ) -> Self {
        Self {
            task,
            start: range.start,
            end: range.end.max(range.start),
            cursor: range.start,
            priority,
            affinity,
            reported: false,
        }
    }

    /// Runs one turn. Returns true once the slice has finished.
    pub fn run(&mut self) -> bool {
        if self.reported {
            return true;
        }
        if self.task.is_cancelled() || self.cursor >= self.end {
            self.finish();
            return true;
        }

        let remaining = self.end - self.cursor;
        let mut processed = self.task.invoke(self.cursor, self.end);
        if processed > remaining {
            warn!(
                task = %self.task.name(),
                processed,
                remaining,
                "runnable reported more indices than it was given"
            );
            processed = remaining;
        }
        self.cursor += processed;
        self.task.record_processed(processed);

        if self.cursor >= self.end {
            self.finish();
        }
        self.reported
    }

    /// Reports completion if not done already.
    pub(crate) fn finish(&mut self) {
        if !self.reported {
            self.reported = true;
            self.task.report_finished(false);
        }
    }

    /// Returns true once completion was reported.
    #[must_use]
    pub fn has_finished(&self) -> bool {
        self.reported
    }

    /// Returns true if the slice should be dropped without running.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.reported || self.task.is_cancelled()
    }

    /// The owning task.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The full slice.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Next index to process.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Indices left.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    /// Queue priority.
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Streams allowed to pick this slice from the shared queue.
    #[must_use]
    pub fn affinity(&self) -> TaskStreamAffinity {
        self.affinity
    }
}

impl Drop for RangedTask {
    fn drop(&mut self) {
        if !self.reported {
            self.reported = true;
            self.task.report_finished(true);
        }
    }
}

impl std::fmt::Debug for RangedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedTask")
            .field("task", &self.task.name())
            .field("range", &self.range())
            .field("cursor", &self.cursor)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_partial_progress_resumes() {
        let sum = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&sum);
        let task = Task::new("chunks", move |start: usize, end: usize| {
            let stop = end.min(start + 3);
            inner.fetch_add((start..stop).sum::<usize>(), Ordering::Relaxed);
            stop - start
        });
        let mut ranged = RangedTask::new(task.clone(), 0..10, TaskPriority::Normal, TaskStreamAffinity::all());

        let mut turns = 0;
        while !ranged.run() {
            turns += 1;
        }
        assert_eq!(turns, 3);
        assert_eq!(sum.load(Ordering::Relaxed), 45);
        assert_eq!(ranged.remaining(), 0);
        assert!(ranged.has_finished());
        assert_eq!(task.progress().finished_slices, 1);
        assert_eq!(task.progress().processed_indices, 10);
    }

    #[test]
    fn test_overreporting_is_clamped() {
        let task = Task::new("greedy", |_: usize, _: usize| 1_000);
        let mut ranged = RangedTask::new(task.clone(), 5..10, TaskPriority::Low, TaskStreamAffinity::all());
        assert!(ranged.run());
        assert_eq!(ranged.cursor(), 10);
        assert_eq!(task.progress().processed_indices, 5);
    }

    #[test]
    fn test_cancelled_slice_finishes_without_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&calls);
        let task = Task::new("cancelled", move |_: usize, _: usize| {
            inner.fetch_add(1, Ordering::Relaxed);
            1
        });
        let mut ranged = RangedTask::new(task.clone(), 0..4, TaskPriority::Normal, TaskStreamAffinity::all());
        assert!(!ranged.run());
        task.cancel();
        assert!(ranged.is_stale());
        assert!(ranged.run());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(task.progress().finished_slices, 1);
    }

    #[test]
    fn test_completion_reported_once() {
        let task = Task::new("once", |start: usize, end: usize| end - start);
        let mut ranged = RangedTask::new(task.clone(), 0..4, TaskPriority::Normal, TaskStreamAffinity::all());
        assert!(ranged.run());
        assert!(ranged.run());
        drop(ranged);
        let progress = task.progress();
        assert_eq!(progress.finished_slices, 1);
        assert_eq!(progress.abandoned_slices, 0);
    }

    #[test]
    fn test_dropping_unfinished_slice_reports_abandoned() {
        let task = Task::new("abandoned", |_: usize, _: usize| 0);
        let ranged = RangedTask::new(task.clone(), 0..4, TaskPriority::Normal, TaskStreamAffinity::all());
        drop(ranged);
        let progress = task.progress();
        assert_eq!(progress.finished_slices, 1);
        assert_eq!(progress.abandoned_slices, 1);
    }

    #[test]
    fn test_empty_slice_finishes_immediately() {
        let task = Task::new("empty", |_: usize, _: usize| -> usize { panic!("must not run") });
        let mut ranged = RangedTask::new(task, 3..3, TaskPriority::Normal, TaskStreamAffinity::all());
        assert!(ranged.run());
    }
}
