//! # EMBER
//!
//! Engine runtime core: engine-controlled memory ([`ember_core`]) and the
//! multi-stream task scheduler ([`ember_tasks`]), configured from one TOML
//! file and brought up by [`Runtime`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember::{EngineConfig, Runtime};
//! use ember::tasks::{Task, TaskPriority};
//!
//! let runtime = Runtime::start(EngineConfig::load("ember.toml")?)?;
//! let task = Task::new("Cull", |start, end| cull(start..end));
//! task.start(runtime.tasks(), 0..objects, 16, TaskPriority::High);
//! task.wait();
//! runtime.shutdown()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod runtime;

/// Re-export of the memory kernel.
pub use ember_core as kernel;
/// Re-export of the scheduler.
pub use ember_tasks as tasks;

pub use config::{EngineConfig, MemoryConfig};
pub use error::{EngineError, EngineResult};
pub use runtime::Runtime;
