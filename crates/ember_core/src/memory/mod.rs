//! # Memory Management
//!
//! Registered allocators and scoped allocation for engine-controlled memory.
//!
//! ## Design Philosophy
//!
//! Every allocator registers itself in the process-wide [`AllocatorRegistry`]
//! and is addressed through an opaque [`AllocatorHandle`]. Code that just
//! needs memory calls [`allocate`] / [`deallocate`], which route to the
//! thread's *current* allocator, switched with an [`AllocationScope`].
//!
//! ```text
//!   AllocationScope::new(handle)      thread-local handle stack
//!            │                        ┌──────────────────────────┐
//!            └──────── push ────────> │ System │ Stream │ Stack  │ <- current
//!                                     └──────────────────────────┘
//!   memory::allocate(n) ──> registry().allocate(current, n) ──> Allocator
//! ```
//!
//! ## Failure Policy
//!
//! - **Capacity**: a full allocator falls back to its *parent* (the handle
//!   current when it was built) and counts the fallback
//! - **Configuration** (invalid handle, wrong thread): logged, resolved to
//!   the system allocator; fatal in debug builds
//! - **Usage** (double free, foreign pointer, oversized pool request,
//!   leak at deregistration): logged; fatal in debug builds

mod allocator;
mod buffer;
mod config_cache;
mod monotonic;
mod multi_pool;
mod pool;
mod registry;
mod scope;
mod stack;
mod system;

use std::ptr::NonNull;

pub use allocator::{align_up, Allocator, AllocatorKind, MIN_ALIGNMENT};
pub use buffer::{ByteStorage, HeapBuffer, InlineBuffer};
pub use config_cache::{
    config_cache, MultiPoolConfigCache, PoolConfig, CONFIG_CACHE_CLASS, CONFIG_CACHE_VERSION,
    DEFAULT_CONFIG_CACHE_FILE,
};
pub use monotonic::{BumpAllocator, InlineAllocator, MonotonicAllocator, MonotonicArena};
pub use multi_pool::{
    grown_bank_config, MultiPool, MultiPoolAllocator, MultiPoolSettings,
    ThreadSafeMultiPoolAllocator,
};
pub use pool::{IndexWidth, PoolAllocator, PoolArena};
pub use registry::{
    registry, AllocatorDesc, AllocatorHandle, AllocatorRegistry, AllocatorReport, AllocatorStats,
    RegistryEntry, StatsSnapshot, MAX_ALLOCATORS,
};
pub use scope::{current_allocator, scope_depth, with_allocator, AllocationScope};
pub use stack::{StackAllocator, StackArena};
pub use system::SystemAllocator;

/// Allocates `size` bytes from the thread's current allocator.
///
/// Returns `None` only if the current allocator and every fallback behind
/// it are exhausted.
#[inline]
#[must_use]
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    registry().allocate(current_allocator(), size)
}

/// Returns `size` bytes at `ptr` to the thread's current allocator.
///
/// # Safety
///
/// `ptr` must come from [`allocate`] (or the registry) on the allocator
/// that is current *now*, with the same `size`, and must not be used
/// afterwards.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
    registry().deallocate(current_allocator(), ptr, size);
}
