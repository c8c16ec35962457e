//! # Pool Allocator
//!
//! Fixed-size block allocator for objects that are frequently allocated and freed.
//!
//! ## Free List
//!
//! Free blocks form a singly linked list threaded *through the blocks
//! themselves*: the first bytes of every free block hold the index of the
//! next free block. The index is stored with the narrowest width that can
//! encode `block_count`, which doubles as the "end of list" sentinel.
//!
//! ```text
//!   free_head = 2
//!   ┌───────┬───────┬───────┬───────┬───────┐
//!   │ live  │ next=4│ next=1│ live  │ next=5│  (5 == block_count == end)
//!   └───────┴───────┴───────┴───────┴───────┘
//!     0       1       2       3       4
//! ```

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::allocator::{align_up, Allocator, AllocatorKind};
use crate::memory::buffer::{ByteStorage, HeapBuffer};
use crate::memory::config_cache::PoolConfig;
use crate::memory::registry::{
    fall_back, registry, AllocatorDesc, AllocatorHandle, AllocatorStats, Registration,
    StatsSnapshot,
};
use crate::memory::scope::{current_allocator, AllocationScope};

/// Largest alignment a pool block is rounded to.
const MAX_BLOCK_ALIGN: usize = 8;

/// Storage width of the in-block free-list index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexWidth {
    /// One byte, up to 255 blocks.
    U8,
    /// Two bytes, up to 65 535 blocks.
    U16,
    /// Four bytes.
    U32,
}

impl IndexWidth {
    /// Narrowest width able to encode `block_count` itself (the sentinel).
    #[must_use]
    pub const fn for_blocks(block_count: usize) -> Option<Self> {
        if block_count <= u8::MAX as usize {
            Some(Self::U8)
        } else if block_count <= u16::MAX as usize {
            Some(Self::U16)
        } else if block_count <= u32::MAX as usize {
            Some(Self::U32)
        } else {
            None
        }
    }

    /// Width in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// A fixed-size block pool over one heap buffer.
///
/// Not synchronised on its own; [`PoolAllocator`] and the multi-pools keep
/// it behind a lock.
pub struct PoolArena {
    buffer: HeapBuffer,
    block_size: usize,
    block_count: usize,
    stride: usize,
    width: IndexWidth,
    free_head: usize,
    free_count: usize,
    #[cfg(debug_assertions)]
    live: Vec<bool>,
}

impl PoolArena {
    /// Reserves `block_count` blocks of `block_size` bytes, all free.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidPoolConfig`] for zero sizes or when a
    /// block cannot hold a free-list index, and
    /// [`MemoryError::OutOfMemory`] if the buffer cannot be reserved.
    pub fn new(block_size: usize, block_count: usize) -> MemoryResult<Self> {
        let invalid = |reason| MemoryError::InvalidPoolConfig {
            block_size,
            block_count,
            reason,
        };

        if block_size == 0 || block_count == 0 {
            return Err(invalid("block size and block count must be non-zero"));
        }
        let width = IndexWidth::for_blocks(block_count).ok_or_else(|| invalid("too many blocks"))?;
        if width.bytes() > block_size {
            return Err(invalid("block too small to hold a free-list index"));
        }

        let stride = align_up(block_size, block_size.next_power_of_two().min(MAX_BLOCK_ALIGN));
        let len = stride
            .checked_mul(block_count)
            .ok_or(MemoryError::OutOfMemory { size: usize::MAX })?;

        let mut arena = Self {
            buffer: HeapBuffer::new(len)?,
            block_size,
            block_count,
            stride,
            width,
            free_head: 0,
            free_count: block_count,
            #[cfg(debug_assertions)]
            live: vec![false; block_count],
        };
        for block in 0..block_count {
            arena.write_next(block, block + 1);
        }
        Ok(arena)
    }

    /// Bytes per block as requested.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks.
    #[inline]
    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    /// Distance between consecutive blocks.
    #[inline]
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Free-list index width.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> IndexWidth {
        self.width
    }

    /// Free blocks according to the counter.
    #[inline]
    #[must_use]
    pub const fn number_of_free_blocks(&self) -> usize {
        self.free_count
    }

    /// Returns true if at least one block is free.
    #[inline]
    #[must_use]
    pub const fn has_free_block(&self) -> bool {
        self.free_count > 0
    }

    /// Block size and count, `None` if the bank is too large to record.
    #[must_use]
    pub fn config(&self) -> Option<PoolConfig> {
        PoolConfig::from_sizes(self.block_size, self.block_count)
    }

    /// Address of the first block.
    #[inline]
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.buffer.base_addr()
    }

    /// Returns true if `ptr` lies inside the pool's buffer.
    #[inline]
    #[must_use]
    pub fn is_mine(&self, ptr: NonNull<u8>) -> bool {
        self.buffer.contains(ptr)
    }

    /// Index of the block starting at `ptr`, if it is a block boundary.
    #[must_use]
    pub fn block_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = self.buffer.offset_of(ptr)?;
        (offset % self.stride == 0).then_some(offset / self.stride)
    }

    fn read_next(&self, block: usize) -> usize {
        let offset = block * self.stride;
        match self.width {
            IndexWidth::U8 => usize::from(self.buffer.read_u8(offset)),
            IndexWidth::U16 => usize::from(u16::from_le_bytes(self.buffer.read_array(offset))),
            IndexWidth::U32 => u32::from_le_bytes(self.buffer.read_array(offset)) as usize,
        }
    }

    fn write_next(&mut self, block: usize, next: usize) {
        let offset = block * self.stride;
        match self.width {
            IndexWidth::U8 => self.buffer.write_u8(offset, next as u8),
            IndexWidth::U16 => self.buffer.write_bytes(offset, &(next as u16).to_le_bytes()),
            IndexWidth::U32 => self.buffer.write_bytes(offset, &(next as u32).to_le_bytes()),
        }
    }

    /// Pops the free-list head.
    ///
    /// This is a **O(1)** operation.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        if self.free_head == self.block_count {
            return None;
        }

        let block = self.free_head;
        self.free_head = self.read_next(block);
        self.free_count -= 1;
        #[cfg(debug_assertions)]
        {
            self.live[block] = true;
        }

        Some(self.buffer.ptr_at(block * self.stride))
    }

    /// Pushes the block at `ptr` back on the free list.
    ///
    /// Returns false if `ptr` is outside the pool. An address inside the
    /// pool that is not a block boundary (or, in debug builds, a block that
    /// is already free) is a usage error.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> bool {
        if !self.is_mine(ptr) {
            return false;
        }

        let Some(block) = self.block_index(ptr) else {
            verification_failure!(
                "pointer {ptr:p} is not a block boundary of a pool with {} byte blocks",
                self.block_size
            );
            return true;
        };

        #[cfg(debug_assertions)]
        {
            if !self.live[block] {
                verification_failure!("double free of pool block {block}");
                return true;
            }
            self.live[block] = false;
        }

        self.write_next(block, self.free_head);
        self.free_head = block;
        self.free_count += 1;
        true
    }

    /// Walks the free list and returns its length.
    ///
    /// Always equals [`PoolArena::number_of_free_blocks`]; this is the slow
    /// check used by tests and diagnostics.
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.free_head;
        while cursor != self.block_count && len <= self.block_count {
            len += 1;
            cursor = self.read_next(cursor);
        }
        len
    }
}

impl fmt::Debug for PoolArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolArena")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("stride", &self.stride)
            .field("width", &self.width)
            .field("free", &self.free_count)
            .finish()
    }
}

struct PoolBackend {
    name: String,
    arena: Mutex<PoolArena>,
    block_size: usize,
    parent: AllocatorHandle,
    stats: Arc<AllocatorStats>,
}

impl Allocator for PoolBackend {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Pool
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size > self.block_size {
            verification_failure!(
                "request of {} bytes exceeds block size {} of pool '{}'",
                size,
                self.block_size,
                self.name
            );
            return fall_back(&self.name, self.parent, &self.stats, size);
        }

        let served = self.arena.lock().allocate();
        served.or_else(|| fall_back(&self.name, self.parent, &self.stats, size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let mine = self.arena.lock().deallocate(ptr);
        if !mine {
            registry().deallocate(self.parent, ptr, size);
        }
    }

    fn size_of_allocation(&self, ptr: NonNull<u8>) -> Option<usize> {
        if self.arena.lock().is_mine(ptr) {
            Some(self.block_size)
        } else {
            registry().size_of_allocation(self.parent, ptr)
        }
    }
}

/// A registered pool of fixed-size blocks.
///
/// Objects can be allocated and freed individually, but all objects share
/// one block size. This is perfect for things like particles, network
/// packets, or temporary game objects.
///
/// # Thread Safety
///
/// The arena sits behind a mutex, so the pool is registered without an
/// owner thread and may be used from anywhere.
///
/// # Example
///
/// ```rust,ignore
/// let pool = PoolAllocator::new("Particles", 64, 10_000)?;
///
/// // O(1), no heap allocation
/// let particle = pool.allocate(48).unwrap();
///
/// // O(1), no heap deallocation
/// unsafe { pool.deallocate(particle, 48) };
/// ```
pub struct PoolAllocator {
    registration: Registration,
    backend: Arc<PoolBackend>,
}

impl PoolAllocator {
    /// Creates and registers a pool.
    ///
    /// # Errors
    ///
    /// Fails on an invalid block configuration, when the buffer cannot be
    /// reserved, or when the registry is full.
    pub fn new(name: impl Into<String>, block_size: usize, block_count: usize) -> MemoryResult<Self> {
        let name = name.into();
        let arena = PoolArena::new(block_size, block_count)?;
        let capacity = arena.stride() * block_count;
        let stats = Arc::new(AllocatorStats::new());
        let backend = Arc::new(PoolBackend {
            name: name.clone(),
            arena: Mutex::new(arena),
            block_size,
            parent: current_allocator(),
            stats: Arc::clone(&stats),
        });
        let desc = AllocatorDesc::new(name).with_capacity(capacity).with_stats(stats);
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

    /// Bytes per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.backend.block_size
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.backend.arena.lock().block_count()
    }

    /// Free blocks.
    #[must_use]
    pub fn number_of_free_blocks(&self) -> usize {
        self.backend.arena.lock().number_of_free_blocks()
    }

    /// Walks the free list; equals [`PoolAllocator::number_of_free_blocks`].
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        self.backend.arena.lock().free_list_len()
    }

    /// Allocates one block through the registry.
    ///
    /// `size` larger than the block size is a usage error.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        registry().allocate(self.handle(), size)
    }

    /// Frees a block through the registry.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`PoolAllocator::allocate`] with the same
    /// `size` and not have been freed.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        registry().deallocate(self.handle(), ptr, size);
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

    /// Makes this pool the thread's current allocator.
    pub fn scope(&self) -> AllocationScope {
        AllocationScope::new(self.handle())
    }
}

impl fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("name", &self.backend.name)
            .field("handle", &self.handle())
            .field("arena", &*self.backend.arena.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_width_selection() {
        assert_eq!(IndexWidth::for_blocks(1), Some(IndexWidth::U8));
        assert_eq!(IndexWidth::for_blocks(255), Some(IndexWidth::U8));
        assert_eq!(IndexWidth::for_blocks(256), Some(IndexWidth::U16));
        assert_eq!(IndexWidth::for_blocks(65_535), Some(IndexWidth::U16));
        assert_eq!(IndexWidth::for_blocks(65_536), Some(IndexWidth::U32));
    }

    #[test]
    fn test_rejects_blocks_too_small_for_index() {
        assert!(PoolArena::new(1, 255).is_ok());
        assert!(matches!(
            PoolArena::new(1, 256),
            Err(MemoryError::InvalidPoolConfig { .. })
        ));
        assert!(PoolArena::new(2, 65_535).is_ok());
        assert!(PoolArena::new(3, 65_536).is_err());
        assert!(PoolArena::new(0, 10).is_err());
        assert!(PoolArena::new(10, 0).is_err());
    }

    #[test]
    fn test_pool_allocate_free() {
        let mut arena = PoolArena::new(32, 10).unwrap();
        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.number_of_free_blocks(), 8);

        assert!(arena.deallocate(a));
        assert_eq!(arena.number_of_free_blocks(), 9);
        assert_eq!(arena.free_list_len(), 9);

        // LIFO reuse
        assert_eq!(arena.allocate(), Some(a));
        assert!(arena.deallocate(a));
        assert!(arena.deallocate(b));
    }

    #[test]
    fn test_arena_config_reports_shape() {
        let arena = PoolArena::new(48, 20).unwrap();
        assert_eq!(arena.config(), Some(PoolConfig::new(48, 20)));
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut arena = PoolArena::new(8, 3).unwrap();
        let blocks: Vec<_> = (0..3).map(|_| arena.allocate().unwrap()).collect();
        assert!(arena.allocate().is_none());
        assert!(!arena.has_free_block());
        for block in blocks {
            assert!(arena.deallocate(block));
        }
        assert_eq!(arena.free_list_len(), 3);
    }

    #[test]
    fn test_stride_alignment() {
        let arena = PoolArena::new(12, 4).unwrap();
        assert_eq!(arena.stride(), 16);
        let arena = PoolArena::new(3, 4).unwrap();
        assert_eq!(arena.stride(), 4);
    }

    #[test]
    fn test_foreign_pointer_is_not_mine() {
        let mut arena = PoolArena::new(16, 4).unwrap();
        let mut other = PoolArena::new(16, 4).unwrap();
        let ptr = other.allocate().unwrap();
        assert!(!arena.deallocate(ptr));
        assert!(other.deallocate(ptr));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not a block boundary")]
    fn test_misaligned_free_is_fatal_in_debug() {
        let mut arena = PoolArena::new(16, 4).unwrap();
        let ptr = arena.allocate().unwrap();
        let inner = NonNull::new(ptr.as_ptr().wrapping_add(3)).unwrap();
        arena.deallocate(inner);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal_in_debug() {
        let mut arena = PoolArena::new(16, 4).unwrap();
        let ptr = arena.allocate().unwrap();
        arena.deallocate(ptr);
        arena.deallocate(ptr);
    }

    #[test]
    fn test_allocator_counts_fallbacks() {
        let pool = PoolAllocator::new("pool::fallback", 64, 2).unwrap();
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(10).unwrap();
        let c = pool.allocate(64).unwrap();
        assert_eq!(pool.fallback_count(), 1);
        assert_eq!(pool.number_of_free_blocks(), 0);

        unsafe {
            pool.deallocate(c, 64);
            pool.deallocate(b, 10);
            pool.deallocate(a, 64);
        }
        assert_eq!(pool.number_of_free_blocks(), 2);
        assert_eq!(pool.stats().live_bytes, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_oversized_request_is_fatal_in_debug() {
        let pool = PoolAllocator::new("pool::oversized", 16, 4).unwrap();
        let handle = pool.handle();
        let result = std::panic::catch_unwind(|| registry().allocate(handle, 17));
        assert!(result.is_err());
    }
}
