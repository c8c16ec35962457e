//! # Monotonic Allocator
//!
//! A bump allocator for temporary allocations that are freed all at once.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::MemoryResult;
use crate::memory::allocator::{align_up, Allocator, AllocatorKind, MIN_ALIGNMENT};
use crate::memory::buffer::{ByteStorage, HeapBuffer, InlineBuffer};
use crate::memory::registry::{
    fall_back, registry, AllocatorDesc, AllocatorHandle, AllocatorStats, Registration,
    StatsSnapshot,
};
use crate::memory::scope::{current_allocator, AllocationScope};

/// A bump-pointer region.
///
/// Allocations are fast (just bump an offset). Individual frees reclaim
/// nothing; the whole region is rewound with [`MonotonicArena::reset`].
pub struct MonotonicArena<S: ByteStorage> {
    storage: S,
    offset: usize,
    outstanding: usize,
}

impl<S: ByteStorage> MonotonicArena<S> {
    /// Wraps `storage`, starting empty.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            offset: 0,
            outstanding: 0,
        }
    }

    /// Returns the total capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the current used space in bytes.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.offset
    }

    /// Returns the remaining free space in bytes.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.offset
    }

    /// Allocations not yet released.
    #[inline]
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Returns true if `ptr` lies inside the region.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.storage.contains(ptr)
    }

    /// Bumps out `size` bytes aligned to [`MIN_ALIGNMENT`], or `None` if
    /// out of space.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let start = align_up(self.offset, MIN_ALIGNMENT);
        let end = start.checked_add(size.max(1))?;
        if end > self.capacity() {
            return None;
        }

        self.offset = end;
        self.outstanding += 1;
        Some(self.storage.ptr_at(start))
    }

    /// Notes that one allocation was released. Memory is not reclaimed.
    #[inline]
    pub fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Rewinds to empty.
    ///
    /// Refuses (returns false) while allocations are outstanding, since
    /// rewinding would hand their bytes out again.
    pub fn reset(&mut self) -> bool {
        if self.outstanding != 0 {
            return false;
        }
        self.offset = 0;
        true
    }
}

impl<S: ByteStorage> fmt::Debug for MonotonicArena<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicArena")
            .field("capacity", &self.capacity())
            .field("used", &self.offset)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

struct MonotonicBackend<S: ByteStorage> {
    name: String,
    kind: AllocatorKind,
    arena: Mutex<MonotonicArena<S>>,
    parent: AllocatorHandle,
    stats: Arc<AllocatorStats>,
}

impl<S: ByteStorage> Allocator for MonotonicBackend<S> {
    fn kind(&self) -> AllocatorKind {
        self.kind
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let served = self.arena.lock().allocate(size);
        served.or_else(|| fall_back(&self.name, self.parent, &self.stats, size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let mut arena = self.arena.lock();
        if arena.contains(ptr) {
            arena.release();
            tracing::trace!(allocator = %self.name, size, "monotonic free reclaims nothing");
            return;
        }
        drop(arena);
        registry().deallocate(self.parent, ptr, size);
    }

    fn size_of_allocation(&self, ptr: NonNull<u8>) -> Option<usize> {
        if self.arena.lock().contains(ptr) {
            None
        } else {
            registry().size_of_allocation(self.parent, ptr)
        }
    }
}

/// A registered bump allocator over storage `S`.
///
/// Use the [`MonotonicAllocator`] (heap buffer) or [`InlineAllocator`]
/// (buffer embedded in the allocator object) aliases. Once the region is
/// exhausted requests go to the parent allocator; memory already handed out
/// never moves.
///
/// # Example
///
/// ```rust,ignore
/// let frame = MonotonicAllocator::new("FrameTemp", 1024 * 1024)?;
/// let _scope = frame.scope();
/// // ... allocate freely for the frame ...
/// frame.reset();
/// ```
pub struct BumpAllocator<S: ByteStorage + 'static> {
    registration: Registration,
    backend: Arc<MonotonicBackend<S>>,
}

/// Monotonic allocator over a heap buffer.
pub type MonotonicAllocator = BumpAllocator<HeapBuffer>;

/// Monotonic allocator whose `N`-byte buffer lives inside the allocator.
pub type InlineAllocator<const N: usize> = BumpAllocator<InlineBuffer<N>>;

impl BumpAllocator<HeapBuffer> {
    /// Creates and registers a monotonic allocator of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the buffer cannot be reserved or the registry is full.
    pub fn new(name: impl Into<String>, capacity: usize) -> MemoryResult<Self> {
        Self::register(name.into(), HeapBuffer::new(capacity)?, AllocatorKind::Monotonic, false)
    }
}

impl<const N: usize> BumpAllocator<InlineBuffer<N>> {
    /// Creates and registers an inline allocator of `N` bytes.
    ///
    /// The buffer is built in place on the stack before moving to the heap
    /// with the allocator, so keep `N` modest.
    ///
    /// # Errors
    ///
    /// Fails if the registry is full.
    pub fn new(name: impl Into<String>) -> MemoryResult<Self> {
        Self::register(name.into(), InlineBuffer::new(), AllocatorKind::Inline, true)
    }
}

impl<S: ByteStorage + 'static> BumpAllocator<S> {
    fn register(name: String, storage: S, kind: AllocatorKind, is_inline: bool) -> MemoryResult<Self> {
        let capacity = storage.len();
        let stats = Arc::new(AllocatorStats::new());
        let backend = Arc::new(MonotonicBackend {
            name: name.clone(),
            kind,
            arena: Mutex::new(MonotonicArena::new(storage)),
            parent: current_allocator(),
            stats: Arc::clone(&stats),
        });

        let mut desc = AllocatorDesc::new(name).with_capacity(capacity).with_stats(stats);
        if is_inline {
            desc = desc.inline();
        }
        let registration = Registration::register(backend.clone(), desc)?;

        Ok(Self { registration, backend })
    }

    /// Registry handle.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> AllocatorHandle {
        self.registration.handle()
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.backend.name
    }

    /// Allocates through the registry.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        registry().allocate(self.handle(), size)
    }

    /// Releases through the registry (reclaims nothing for own memory).
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`BumpAllocator::allocate`] with the same
    /// `size` and not have been released.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        registry().deallocate(self.handle(), ptr, size);
    }

    /// Bytes bumped so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.backend.arena.lock().used()
    }

    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.backend.arena.lock().capacity()
    }

    /// Bytes left.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.backend.arena.lock().remaining()
    }

    /// Rewinds the region if nothing is outstanding.
    pub fn reset(&self) -> bool {
        let rewound = self.backend.arena.lock().reset();
        if !rewound {
            tracing::warn!(allocator = %self.backend.name, "reset refused while allocations are outstanding");
        }
        rewound
    }

    /// Requests served by the parent.
    #[must_use]
    pub fn fallback_count(&self) -> u64 {
        self.backend.stats.fallbacks()
    }

    /// Usage counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.backend.stats.snapshot()
    }

    /// Makes this allocator the thread's current allocator.
    pub fn scope(&self) -> AllocationScope {
        AllocationScope::new(self.handle())
    }
}

impl<S: ByteStorage + 'static> fmt::Debug for BumpAllocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpAllocator")
            .field("name", &self.backend.name)
            .field("kind", &self.backend.kind)
            .field("handle", &self.handle())
            .field("arena", &*self.backend.arena.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_allocation() {
        let mut arena = MonotonicArena::new(HeapBuffer::new(1024).unwrap());
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(10).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 16);
        assert_eq!(arena.used(), 26);
    }

    #[test]
    fn test_arena_reset() {
        let mut arena = MonotonicArena::new(HeapBuffer::new(1024).unwrap());
        let _ = arena.allocate(40).unwrap();
        assert!(!arena.reset());

        arena.release();
        assert!(arena.reset());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_free_is_noop_and_overflow_falls_back() {
        let mono = MonotonicAllocator::new("mono::overflow", 64).unwrap();
        let a = mono.allocate(48).unwrap();
        unsafe { mono.deallocate(a, 48) };
        assert_eq!(mono.used(), 48);

        let b = mono.allocate(32).unwrap();
        assert_eq!(mono.fallback_count(), 1);
        unsafe { mono.deallocate(b, 32) };
        assert_eq!(mono.stats().live_bytes, 0);
        assert!(mono.reset());
    }

    #[test]
    fn test_inline_allocator_registers_as_inline() {
        let inline = InlineAllocator::<256>::new("mono::inline").unwrap();
        let entry = registry().entry(inline.handle()).unwrap();
        assert!(entry.is_inline());
        assert_eq!(entry.kind(), AllocatorKind::Inline);
        assert_eq!(entry.capacity(), 256);

        let ptr = inline.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % MIN_ALIGNMENT, 0);
        unsafe { inline.deallocate(ptr, 100) };
    }
}
