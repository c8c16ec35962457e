//! # EMBER Core
//!
//! Engine-controlled memory for the EMBER runtime:
//! - Process-wide allocator registry with opaque handles
//! - Thread-local allocation scopes
//! - Stack, Pool, Monotonic/Inline and Multi-Pool allocators
//! - Lock-free building blocks
//!
//! ## Architecture Rules
//!
//! 1. **Every byte has an owner** - allocations go through a registered allocator
//! 2. **Overflow degrades, never throws** - a full allocator falls back to its parent and counts it
//! 3. **Misuse is loud** - double frees, foreign pointers and leaks abort debug builds
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_core::memory::{self, PoolAllocator};
//!
//! let pool = PoolAllocator::new("Particles", 64, 4096)?;
//! let _scope = pool.scope();
//! // Everything below allocates from the particle pool.
//! let block = memory::allocate(48).expect("pool or parent has room");
//! unsafe { memory::deallocate(block, 48) };
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

/// Reports a violated allocator invariant.
///
/// Always logs through `tracing`. Debug builds then panic (unless the
/// thread is already unwinding); release builds carry on so the caller can
/// degrade gracefully.
macro_rules! verification_failure {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        if cfg!(debug_assertions) && !::std::thread::panicking() {
            panic!($($arg)+);
        }
    }};
}

pub mod error;
pub mod memory;
pub mod sync;

pub use error::{MemoryError, MemoryResult};
pub use memory::{
    allocate, current_allocator, deallocate, registry, with_allocator, AllocationScope,
    Allocator, AllocatorHandle, AllocatorKind, AllocatorRegistry, AllocatorStats, InlineAllocator,
    MonotonicAllocator, MultiPoolAllocator, MultiPoolConfigCache, MultiPoolSettings, PoolAllocator,
    PoolConfig, StackAllocator, ThreadSafeMultiPoolAllocator,
};
pub use sync::{Linked, LockFreeStack, StackNode};
