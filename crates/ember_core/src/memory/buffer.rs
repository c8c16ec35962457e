//! # Backing Buffers
//!
//! Raw byte storage that the arena allocators carve up.
//!
//! ## Safety Note
//!
//! Allocators hand out raw pointers into these buffers while still reading
//! and writing their own bookkeeping bytes in between. To keep that sound,
//! no Rust reference to the buffer contents is ever created: every access
//! goes through the bounds-checked raw-pointer accessors of
//! [`ByteStorage`], all derived from the same base pointer.

#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};

use crate::error::{MemoryError, MemoryResult};
use crate::memory::allocator::MIN_ALIGNMENT;

/// A contiguous, stable, initialised byte region.
///
/// # Safety
///
/// Implementors guarantee that `base()..base() + len()` is a single live
/// allocation, initialised, aligned to [`MIN_ALIGNMENT`], that does not
/// move for as long as the storage value itself does not move.
pub unsafe trait ByteStorage: Send + Sync {
    /// First byte of the region.
    fn base(&self) -> NonNull<u8>;

    /// Length of the region in bytes.
    fn len(&self) -> usize;

    /// Returns true if the region is empty.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the first byte.
    #[inline]
    fn base_addr(&self) -> usize {
        self.base().as_ptr() as usize
    }

    /// Returns true if `ptr` points inside the region.
    #[inline]
    fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Byte offset of `ptr` from the base, if it lies inside the region.
    #[inline]
    fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base_addr())?;
        (offset < self.len()).then_some(offset)
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset > len()`.
    #[inline]
    fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len(), "offset {offset} outside buffer of {}", self.len());
        // SAFETY: offset is within (or one past) the allocation.
        unsafe { NonNull::new_unchecked(self.base().as_ptr().add(offset)) }
    }

    /// Copies `N` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the buffer.
    #[inline]
    fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        check_range(offset, N, self.len());
        let mut out = [0u8; N];
        // SAFETY: range checked above; `out` is a distinct local.
        unsafe { ptr::copy_nonoverlapping(self.base().as_ptr().add(offset), out.as_mut_ptr(), N) };
        out
    }

    /// Writes `bytes` starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the buffer.
    #[inline]
    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        check_range(offset, bytes.len(), self.len());
        // SAFETY: range checked above; `bytes` cannot alias the buffer
        // because no reference into the buffer is ever handed out.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().as_ptr().add(offset), bytes.len());
        }
    }

    /// Reads one byte.
    #[inline]
    fn read_u8(&self, offset: usize) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    /// Writes one byte.
    #[inline]
    fn write_u8(&mut self, offset: usize, value: u8) {
        self.write_bytes(offset, &[value]);
    }

    /// Reads a little-endian `u64`.
    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.read_array(offset))
    }

    /// Writes a little-endian `u64`.
    #[inline]
    fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

#[inline]
#[track_caller]
fn check_range(offset: usize, len: usize, capacity: usize) {
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= capacity),
        "access {offset}..{offset}+{len} outside buffer of {capacity}"
    );
}

/// A zeroed, heap-backed buffer obtained straight from `std::alloc`.
pub struct HeapBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the buffer uniquely owns its allocation and only exposes it
// through raw pointers; synchronisation is the owning allocator's job.
unsafe impl Send for HeapBuffer {}
// SAFETY: see above.
unsafe impl Sync for HeapBuffer {}

impl HeapBuffer {
    /// Reserves `len` zeroed bytes aligned to [`MIN_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfMemory`] if the system refuses.
    pub fn new(len: usize) -> MemoryResult<Self> {
        let layout = Layout::from_size_align(len.max(1), MIN_ALIGNMENT)
            .map_err(|_| MemoryError::OutOfMemory { size: len })?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemoryError::OutOfMemory { size: len })?;
        Ok(Self { ptr, layout, len })
    }
}

// SAFETY: `ptr` is a live zeroed allocation of at least `len` bytes with
// MIN_ALIGNMENT, owned until drop; moving `HeapBuffer` does not move it.
unsafe impl ByteStorage for HeapBuffer {
    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("base", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A fixed buffer embedded in its owner.
///
/// Its address is only stable once the owner stops moving, which is why
/// [`crate::memory::InlineAllocator`] keeps it inside an `Arc`.
#[repr(C, align(16))]
pub struct InlineBuffer<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

// SAFETY: contents are only reached through raw pointers under the owning
// allocator's lock.
unsafe impl<const N: usize> Send for InlineBuffer<N> {}
// SAFETY: see above.
unsafe impl<const N: usize> Sync for InlineBuffer<N> {}

impl<const N: usize> InlineBuffer<N> {
    /// Creates a zeroed inline buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: UnsafeCell::new([0; N]) }
    }
}

impl<const N: usize> Default for InlineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the bytes live inside `self`, are initialised, and the struct is
// 16-byte aligned; the region is stable while `self` is not moved.
unsafe impl<const N: usize> ByteStorage for InlineBuffer<N> {
    #[inline]
    fn base(&self) -> NonNull<u8> {
        NonNull::from(&self.bytes).cast::<u8>()
    }

    #[inline]
    fn len(&self) -> usize {
        N
    }
}

impl<const N: usize> fmt::Debug for InlineBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineBuffer").field("len", &N).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_buffer_is_zeroed_and_aligned() {
        let buffer = HeapBuffer::new(256).unwrap();
        assert_eq!(buffer.len(), 256);
        assert_eq!(buffer.base_addr() % MIN_ALIGNMENT, 0);
        assert!((0..256).all(|i| buffer.read_u8(i) == 0));
    }

    #[test]
    fn test_offsets_and_containment() {
        let buffer = HeapBuffer::new(64).unwrap();
        let inside = buffer.ptr_at(10);
        assert_eq!(buffer.offset_of(inside), Some(10));
        assert!(!buffer.contains(buffer.ptr_at(64)));
    }

    #[test]
    fn test_read_write_round_trip() {
        let mut buffer = HeapBuffer::new(32).unwrap();
        buffer.write_u64(8, 0xDEAD_BEEF_CAFE);
        buffer.write_u8(0, 7);
        assert_eq!(buffer.read_u64(8), 0xDEAD_BEEF_CAFE);
        assert_eq!(buffer.read_u8(0), 7);
    }

    #[test]
    #[should_panic(expected = "outside buffer")]
    fn test_out_of_bounds_write_panics() {
        let mut buffer = HeapBuffer::new(8).unwrap();
        buffer.write_u64(4, 1);
    }

    #[test]
    fn test_inline_buffer_alignment() {
        let buffer = Box::new(InlineBuffer::<48>::new());
        assert_eq!(buffer.len(), 48);
        assert_eq!(buffer.base_addr() % MIN_ALIGNMENT, 0);
    }
}
