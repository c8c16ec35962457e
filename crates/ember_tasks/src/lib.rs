//! # EMBER Tasks
//!
//! Cooperative multi-stream scheduler:
//! - [`Task`]: a named job split into [`RangedTask`] slices
//! - [`TaskStreamAffinity`]: which streams may take a slice
//! - [`TaskStream`]: one thread, one priority queue, one private allocator
//! - [`TaskSystem`]: owns the streams and the shared overflow queue
//!
//! ## Architecture Rules
//!
//! 1. **Never block a stream** - runnables return partial progress and get requeued
//! 2. **Compute stays off Main and IO** - the default affinity excludes both
//! 3. **Every slice reports once** - finished, cancelled or discarded at shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_tasks::{Task, TaskPriority, TaskSystem, TaskSystemConfig};
//!
//! let system = TaskSystem::new(TaskSystemConfig::default())?;
//! let task = Task::new("Particles", |start, end| {
//!     simulate(start..end);
//!     end - start
//! });
//! task.start(&system, 0..particle_count, system.worker_count(), TaskPriority::High);
//! task.wait();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod affinity;
pub mod config;
pub mod error;
pub mod ranged;
pub mod stream;
pub mod system;
pub mod task;

pub use affinity::{TaskStreamAffinity, IO_STREAM, MAIN_STREAM};
pub use config::{TaskSystemConfig, MAX_STREAMS, MIN_STREAMS};
pub use error::{TaskError, TaskResult};
pub use ranged::RangedTask;
pub use stream::{StreamKind, StreamStatsSnapshot, TaskStream};
pub use system::TaskSystem;
pub use task::{partition, Runnable, Task, TaskPriority, TaskProgress};
