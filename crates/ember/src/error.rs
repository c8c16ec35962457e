//! # Engine Error Types

use ember_core::MemoryError;
use ember_tasks::TaskError;
use thiserror::Error;

/// Errors surfaced while bringing the runtime up or down.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine configuration could not be parsed.
    #[error("invalid engine configuration: {0}")]
    Config(String),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocator setup or config cache persistence failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The task system could not start.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
