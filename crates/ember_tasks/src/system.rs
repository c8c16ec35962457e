//! # Task System
//!
//! Owns every stream, the shared overflow queue and the stream threads.
//!
//! ## Layout
//!
//! ```text
//!   index 0   Main      host thread, pumped via `pump_main`
//!   index 1   IO        own thread
//!   index 2+  Worker N  own thread each
//! ```
//!
//! Startup blocks until every stream thread has built and registered its
//! allocator. Shutdown (explicit or on drop) stops the loops, joins the
//! threads and discards whatever is still queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use ember_core::ThreadSafeMultiPoolAllocator;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::affinity::MAIN_STREAM;
use crate::config::TaskSystemConfig;
use crate::error::{TaskError, TaskResult};
use crate::ranged::RangedTask;
use crate::stream::{run_stream_thread, StreamWorker, TaskStream};
use crate::task::Task;

/// Most slices one `pump_main` call runs.
const MAIN_PUMP_BUDGET: usize = 64;

/// State shared by the system handle and every stream thread.
pub(crate) struct SystemShared {
    pub(crate) streams: Vec<TaskStream>,
    pub(crate) config: TaskSystemConfig,
    shared_queue: Mutex<VecDeque<RangedTask>>,
    running: AtomicBool,
}

impl SystemShared {
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Takes the oldest shared slice that `stream` is allowed to run.
    pub(crate) fn dequeue(&self, stream: usize) -> Option<RangedTask> {
        let mut queue = self.shared_queue.lock();
        let position = queue.iter().position(|task| task.affinity().get(stream))?;
        queue.remove(position)
    }

    fn wake_all(&self) {
        for stream in &self.streams {
            stream.wake();
        }
    }
}

/// The scheduler.
pub struct TaskSystem {
    shared: Arc<SystemShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    main: Mutex<StreamWorker>,
    main_allocator: ThreadSafeMultiPoolAllocator,
}

impl TaskSystem {
    /// Builds the streams and starts every stream thread.
    ///
    /// # Errors
    ///
    /// Invalid configuration, a failed thread spawn, or a stream allocator
    /// that could not be built. Threads already started are stopped first.
    pub fn new(config: TaskSystemConfig) -> TaskResult<Self> {
        let stream_count = config.validate()?;
        let settings = config.stream_allocator.clone();

        let main_allocator = ThreadSafeMultiPoolAllocator::new("Main Stream", settings.clone())?;
        let shared = Arc::new(SystemShared {
            streams: (0..stream_count).map(TaskStream::new).collect(),
            config,
            shared_queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        });

        let (ready_tx, ready_rx) = bounded(stream_count);
        let mut threads = Vec::with_capacity(stream_count - 1);
        for index in (MAIN_STREAM + 1)..stream_count {
            let thread_shared = Arc::clone(&shared);
            let thread_settings = settings.clone();
            let ready = ready_tx.clone();
            let spawned = thread::Builder::new()
                .name(shared.streams[index].name().to_owned())
                .spawn(move || run_stream_thread(thread_shared, index, thread_settings, ready));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(spawn_error) => {
                    Self::abort_startup(&shared, threads);
                    return Err(TaskError::StreamStartup(format!(
                        "could not spawn {}: {spawn_error}",
                        shared.streams[index].name()
                    )));
                }
            }
        }
        drop(ready_tx);

        for _ in 1..stream_count {
            let failure = match ready_rx.recv() {
                Ok(Ok(())) => continue,
                Ok(Err(memory_error)) => memory_error.to_string(),
                Err(_) => "stream thread exited before reporting ready".to_owned(),
            };
            Self::abort_startup(&shared, threads);
            return Err(TaskError::StreamStartup(failure));
        }

        info!(
            streams = stream_count,
            workers = stream_count - 2,
            "task system started"
        );
        let main = StreamWorker::new(Arc::clone(&shared), MAIN_STREAM, main_allocator.handle());
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            main: Mutex::new(main),
            main_allocator,
        })
    }

    fn abort_startup(shared: &SystemShared, threads: Vec<JoinHandle<()>>) {
        shared.running.store(false, Ordering::Release);
        shared.wake_all();
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Total streams including Main and IO.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }

    /// Generic worker streams (everything except Main and IO).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.stream_count() - 2
    }

    /// Stream at `index`.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidStream`] when `index` is out of range.
    pub fn stream(&self, index: usize) -> TaskResult<&TaskStream> {
        self.shared.streams.get(index).ok_or(TaskError::InvalidStream {
            index,
            count: self.stream_count(),
        })
    }

    /// Returns true until shutdown.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Allocator the Main stream runs slices under.
    #[must_use]
    pub fn main_allocator(&self) -> &ThreadSafeMultiPoolAllocator {
        &self.main_allocator
    }

    /// Slices waiting in the shared queue.
    #[must_use]
    pub fn shared_pending(&self) -> usize {
        self.shared.shared_queue.lock().len()
    }

    /// Queues a slice on the shared queue and wakes the streams allowed to
    /// take it. After shutdown the slice is dropped (reported abandoned).
    pub fn enqueue(&self, task: RangedTask) {
        let affinity = task.affinity();
        let mut queue = self.shared.shared_queue.lock();
        // Checked under the lock `shutdown` clears the flag under.
        if !self.shared.is_running() {
            drop(queue);
            warn!(task = %task.task().name(), "enqueue after shutdown, slice dropped");
            return;
        }
        queue.push_back(task);
        drop(queue);
        for stream in &self.shared.streams {
            if affinity.get(stream.index()) {
                stream.wake();
            }
        }
    }

    /// Queues a slice directly on stream `stream`.
    ///
    /// Returns false (and logs) when the index is out of range or the
    /// stream is closed by shutdown; the slice is then dropped.
    pub fn enqueue_to(&self, stream: usize, task: RangedTask) -> bool {
        let Some(target) = self.shared.streams.get(stream) else {
            error!(
                task = %task.task().name(),
                stream,
                streams = self.stream_count(),
                "enqueue to invalid stream index"
            );
            return false;
        };
        match target.push(task) {
            Ok(()) => true,
            Err(rejected) => {
                warn!(task = %rejected.task().name(), stream = %target.name(), "enqueue after shutdown, slice dropped");
                false
            }
        }
    }

    /// Takes a shared slice that `stream` may run.
    #[must_use]
    pub fn dequeue(&self, stream: usize) -> Option<RangedTask> {
        self.shared.dequeue(stream)
    }

    /// Runs pending Main-stream work on the calling thread.
    ///
    /// Returns the number of slices run. Reentrant calls (from inside a
    /// Main-stream runnable) return 0.
    pub fn pump_main(&self) -> usize {
        let Some(mut main) = self.main.try_lock() else {
            return 0;
        };
        let mut ran = 0;
        while ran < MAIN_PUMP_BUDGET && main.tick(false) {
            ran += 1;
        }
        if !self.is_running() {
            main.discard_deferred();
        }
        ran
    }

    /// Pumps the Main stream until `task` is done.
    pub fn run_main_until_done(&self, task: &Task) {
        while !task.is_done() {
            if self.pump_main() == 0 {
                thread::yield_now();
            }
        }
    }

    /// Stops every stream, joins their threads (except the caller's own)
    /// and discards queued work.
    pub fn shutdown(&self) {
        let was_running = {
            let _queue = self.shared.shared_queue.lock();
            self.shared.running.swap(false, Ordering::AcqRel)
        };
        if !was_running {
            return;
        }
        self.shared.wake_all();

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("stream").to_owned();
            if handle.join().is_err() {
                error!(stream = %name, "stream thread panicked");
            }
        }

        let mut discarded: usize = self.shared.shared_queue.lock().drain(..).count();
        discarded += self.shared.streams.iter().map(TaskStream::close).sum::<usize>();
        if let Some(mut main) = self.main.try_lock() {
            discarded += main.discard_deferred();
        }
        if discarded > 0 {
            warn!(discarded, "discarded pending slices at shutdown");
        }
        info!("task system stopped");
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSystem")
            .field("streams", &self.shared.streams)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
