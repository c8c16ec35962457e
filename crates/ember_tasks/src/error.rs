//! # Task Error Types
//!
//! Construction-time failures of the scheduler. Scheduling mistakes at
//! runtime (bad stream index, enqueue after shutdown) are logged and become
//! no-ops instead.

use ember_core::MemoryError;
use thiserror::Error;

/// Errors that can occur while building the task system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Fewer streams than Main, IO and two workers.
    #[error("task system needs at least {minimum} streams, {requested} requested")]
    TooFewStreams {
        /// Streams requested.
        requested: usize,
        /// Smallest supported count.
        minimum: usize,
    },

    /// More streams than an affinity mask can address.
    #[error("task system supports at most {maximum} streams, {requested} requested")]
    TooManyStreams {
        /// Streams requested.
        requested: usize,
        /// Largest supported count.
        maximum: usize,
    },

    /// A stream index outside the system.
    #[error("stream index {index} out of range (system has {count} streams)")]
    InvalidStream {
        /// Index used.
        index: usize,
        /// Streams in the system.
        count: usize,
    },

    /// Any other invalid scheduler setting.
    #[error("invalid task system configuration: {0}")]
    InvalidConfig(String),

    /// A stream thread could not be spawned or failed to come up.
    #[error("stream startup failed: {0}")]
    StreamStartup(String),

    /// A stream allocator could not be built.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Result type for task system operations.
pub type TaskResult<T> = Result<T, TaskError>;
