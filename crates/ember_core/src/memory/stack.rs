//! # Stack Allocator
//!
//! LIFO bump allocation with lazy reclamation of out-of-order frees.
//!
//! ## Block Layout
//!
//! ```text
//!   ┌──────────── header (16) ────────────┬─ payload ─┬── trailer (16) ──┐
//!   │ marker │ pad (7) │ size (u64 LE)     │ size→16   │ size (u64 LE)    │
//!   └────────┴─────────┴───────────────────┴───────────┴──────────────────┘
//!   ^ block start                          ^ returned pointer
//! ```
//!
//! Freeing the top block retreats the cursor and then keeps walking
//! backward through the trailers, swallowing every block whose marker was
//! already cleared by an earlier out-of-order free.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::MemoryResult;
use crate::memory::allocator::{align_up, Allocator, AllocatorKind, MIN_ALIGNMENT};
use crate::memory::buffer::{ByteStorage, HeapBuffer};
use crate::memory::registry::{
    fall_back, registry, AllocatorDesc, AllocatorHandle, AllocatorStats, Registration,
    StatsSnapshot,
};
use crate::memory::scope::{current_allocator, AllocationScope};

const HEADER: usize = 16;
const TRAILER: usize = 16;
const SIZE_OFFSET: usize = 8;
const LIVE: u8 = 0xA5;
const FREED: u8 = 0x00;

/// Bump region with per-block headers and trailers.
pub struct StackArena {
    buffer: HeapBuffer,
    top: usize,
    live_blocks: usize,
}

impl StackArena {
    /// Reserves `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MemoryError::OutOfMemory`] if the buffer cannot be
    /// reserved.
    pub fn new(capacity: usize) -> MemoryResult<Self> {
        Ok(Self {
            buffer: HeapBuffer::new(capacity)?,
            top: 0,
            live_blocks: 0,
        })
    }

    #[inline]
    fn block_len(size: usize) -> Option<usize> {
        let payload = size.checked_add(MIN_ALIGNMENT - 1)? & !(MIN_ALIGNMENT - 1);
        payload.checked_add(HEADER + TRAILER)
    }

    /// Total bytes reserved.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes between the base and the cursor, bookkeeping included.
    #[inline]
    #[must_use]
    pub fn usage(&self) -> usize {
        self.top
    }

    /// Bytes left above the cursor.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.top
    }

    /// Blocks allocated and not yet freed.
    #[inline]
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.live_blocks
    }

    /// Returns true if `ptr` lies inside this arena's buffer.
    #[inline]
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.buffer.contains(ptr)
    }

    /// Carves a block off the top, or `None` if it does not fit.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let len = Self::block_len(size)?;
        if len > self.remaining() {
            return None;
        }

        let start = self.top;
        self.buffer.write_u8(start, LIVE);
        self.buffer.write_u64(start + SIZE_OFFSET, size as u64);
        self.buffer.write_u64(start + len - TRAILER, size as u64);
        self.top += len;
        self.live_blocks += 1;

        Some(self.buffer.ptr_at(start + HEADER))
    }

    /// Requested size of the live block at `ptr`.
    #[must_use]
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let start = self.block_start(ptr)?;
        (self.buffer.read_u8(start) == LIVE).then(|| self.buffer.read_u64(start + SIZE_OFFSET) as usize)
    }

    fn block_start(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = self.buffer.offset_of(ptr)?;
        if offset < HEADER || offset >= self.top || offset % MIN_ALIGNMENT != 0 {
            return None;
        }
        Some(offset - HEADER)
    }

    /// Frees the block at `ptr`.
    ///
    /// Returns false if `ptr` is outside the buffer (the caller owns the
    /// decision of where it goes). A pointer inside the buffer that is not
    /// a live block is a usage error.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> bool {
        if !self.buffer.contains(ptr) {
            return false;
        }

        let Some(start) = self.block_start(ptr) else {
            verification_failure!("pointer {ptr:p} is not the start of a stack block");
            return true;
        };

        if self.buffer.read_u8(start) != LIVE {
            verification_failure!("double free of stack block at offset {start}");
            return true;
        }

        let size = self.buffer.read_u64(start + SIZE_OFFSET) as usize;
        let len = align_up(size, MIN_ALIGNMENT) + HEADER + TRAILER;
        self.buffer.write_u8(start, FREED);
        self.live_blocks -= 1;

        if start + len == self.top {
            self.top = start;
            self.coalesce();
        }
        true
    }

    fn coalesce(&mut self) {
        while self.top > 0 {
            let size = self.buffer.read_u64(self.top - TRAILER) as usize;
            let start = self.top - (align_up(size, MIN_ALIGNMENT) + HEADER + TRAILER);
            if self.buffer.read_u8(start) != FREED {
                break;
            }
            self.top = start;
        }
    }
}

impl fmt::Debug for StackArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackArena")
            .field("capacity", &self.capacity())
            .field("usage", &self.top)
            .field("live_blocks", &self.live_blocks)
            .finish()
    }
}

struct StackBackend {
    name: String,
    arena: Mutex<StackArena>,
    parent: AllocatorHandle,
    stats: Arc<AllocatorStats>,
}

impl Allocator for StackBackend {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Stack
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let served = self.arena.lock().allocate(size);
        served.or_else(|| fall_back(&self.name, self.parent, &self.stats, size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let mine = self.arena.lock().deallocate(ptr);
        if !mine {
            registry().deallocate(self.parent, ptr, size);
        }
    }

    fn size_of_allocation(&self, ptr: NonNull<u8>) -> Option<usize> {
        let arena = self.arena.lock();
        if arena.owns(ptr) {
            return arena.size_of(ptr);
        }
        drop(arena);
        registry().size_of_allocation(self.parent, ptr)
    }
}

/// A registered, single-owner stack allocator.
///
/// The parent is whichever allocator was current when the stack was built;
/// requests that do not fit go there and are counted as fallbacks.
///
/// # Example
///
/// ```rust,ignore
/// let stack = StackAllocator::new("FrameScratch", 64 * 1024)?;
/// let a = stack.allocate(128).unwrap();
/// let b = stack.allocate(256).unwrap();
/// unsafe {
///     stack.deallocate(b, 256);
///     stack.deallocate(a, 128);
/// }
/// assert_eq!(stack.usage(), 0);
/// ```
pub struct StackAllocator {
    registration: Registration,
    backend: Arc<StackBackend>,
    // Single owner: must be dropped on the registering thread.
    _not_send: PhantomData<*const ()>,
}

impl StackAllocator {
    /// Creates and registers a stack of `capacity` bytes owned by the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// Fails if the buffer cannot be reserved or the registry is full.
    pub fn new(name: impl Into<String>, capacity: usize) -> MemoryResult<Self> {
        let name = name.into();
        let stats = Arc::new(AllocatorStats::new());
        let backend = Arc::new(StackBackend {
            name: name.clone(),
            arena: Mutex::new(StackArena::new(capacity)?),
            parent: current_allocator(),
            stats: Arc::clone(&stats),
        });
        let desc = AllocatorDesc::new(name)
            .with_capacity(capacity)
            .owned_by_current_thread()
            .with_stats(stats);
        let registration = Registration::register(backend.clone(), desc)?;

        Ok(Self {
            registration,
            backend,
            _not_send: PhantomData,
        })
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

    /// Parent allocator used for overflow.
    #[must_use]
    pub fn parent(&self) -> AllocatorHandle {
        self.backend.parent
    }

    /// Allocates through the registry.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        registry().allocate(self.handle(), size)
    }

    /// Frees through the registry.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`StackAllocator::allocate`] with the same
    /// `size` and not have been freed.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        registry().deallocate(self.handle(), ptr, size);
    }

    /// Bytes in use, bookkeeping included.
    #[must_use]
    pub fn usage(&self) -> usize {
        self.backend.arena.lock().usage()
    }

    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.backend.arena.lock().capacity()
    }

    /// Bytes left above the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.backend.arena.lock().remaining()
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

    /// Makes this stack the thread's current allocator.
    pub fn scope(&self) -> AllocationScope {
        AllocationScope::new(self.handle())
    }
}

impl fmt::Debug for StackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackAllocator")
            .field("name", &self.backend.name)
            .field("handle", &self.handle())
            .field("arena", &*self.backend.arena.lock())
            .finish()
    }
}
