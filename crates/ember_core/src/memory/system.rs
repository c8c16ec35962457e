//! # System Allocator
//!
//! The default allocator living in registry slot 0. Every fallback chain
//! ends here.

#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::memory::allocator::{Allocator, AllocatorKind, MIN_ALIGNMENT};

/// Passthrough to `std::alloc` with [`MIN_ALIGNMENT`].
///
/// Blocks are zeroed so that every allocator in the engine hands out
/// initialised memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    #[inline]
    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(1), MIN_ALIGNMENT).ok()
    }
}

impl Allocator for SystemAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::System
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: layout size is non-zero.
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if let Some(layout) = Self::layout(size) {
            // SAFETY: caller guarantees `ptr` came from `allocate(size)`,
            // which used this exact layout.
            dealloc(ptr.as_ptr(), layout);
        }
    }

    fn size_of_allocation(&self, _ptr: NonNull<u8>) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_round_trip() {
        let system = SystemAllocator;
        let ptr = system.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % MIN_ALIGNMENT, 0);
        unsafe { system.deallocate(ptr, 100) };
    }

    #[test]
    fn test_zero_sized_request_still_yields_memory() {
        let system = SystemAllocator;
        let ptr = system.allocate(0).unwrap();
        unsafe { system.deallocate(ptr, 0) };
    }
}
