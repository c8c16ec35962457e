//! # Memory Error Types
//!
//! Construction-time failures of the memory framework.
//!
//! Hot-path problems (capacity overflow, bad frees, invalid handles) are
//! never returned as errors: they are logged, counted and resolved through
//! fallback allocation. See [`crate::memory`] for that policy.

use thiserror::Error;

/// Errors that can occur while building or persisting allocators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Every slot of the allocator registry is taken.
    #[error("allocator registry full: all {capacity} slots are in use")]
    RegistryFull {
        /// Number of slots in the registry.
        capacity: usize,
    },

    /// A pool was requested with a shape it cannot represent.
    #[error("invalid pool configuration: {block_count} blocks of {block_size} bytes ({reason})")]
    InvalidPoolConfig {
        /// Requested block size in bytes.
        block_size: usize,
        /// Requested number of blocks.
        block_count: usize,
        /// Why the shape was rejected.
        reason: &'static str,
    },

    /// Any other invalid allocator setting.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),

    /// The system allocator refused to back a buffer.
    #[error("out of memory: could not reserve {size} bytes")]
    OutOfMemory {
        /// Bytes requested.
        size: usize,
    },

    /// A persisted config cache did not match the expected format.
    #[error("config cache rejected: {0}")]
    CacheFormat(String),

    /// Reading or writing the config cache file failed.
    #[error("config cache I/O failed: {0}")]
    CacheIo(String),
}

/// Result type for memory framework operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
