//! # Allocator Interface
//!
//! The capability every registered allocator exposes to the registry.

#![allow(unsafe_code)]

use std::ptr::NonNull;

/// Alignment guaranteed by every bump/stack/system allocation.
///
/// Pool blocks are aligned to their own stride instead (see
/// [`crate::memory::PoolArena`]).
pub const MIN_ALIGNMENT: usize = 16;

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The closed set of allocation strategies known to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// `std::alloc` passthrough living in registry slot 0.
    System,
    /// LIFO bump allocator with lazy out-of-order reclamation.
    Stack,
    /// Fixed block-size free-list pool.
    Pool,
    /// Bump allocator that never reclaims.
    Monotonic,
    /// Monotonic allocator whose buffer lives inside the allocator object.
    Inline,
    /// Size-classed pool banks, single owner thread.
    MultiPool,
    /// Size-classed pool banks behind one mutex.
    ThreadSafeMultiPool,
    /// Anything registered from outside this crate.
    Custom,
}

impl AllocatorKind {
    /// Short human-readable name used in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Stack => "stack",
            Self::Pool => "pool",
            Self::Monotonic => "monotonic",
            Self::Inline => "inline",
            Self::MultiPool => "multi-pool",
            Self::ThreadSafeMultiPool => "thread-safe multi-pool",
            Self::Custom => "custom",
        }
    }
}

/// A polymorphic allocation capability.
///
/// Implementations are stored behind `Arc<dyn Allocator>` in the registry
/// and may be invoked from any thread that holds their handle, hence the
/// `Send + Sync` bound. Single-owner allocators still satisfy it (their
/// state sits behind an uncontended lock) and additionally register an
/// owner thread that the registry verifies on every call.
///
/// Memory returned by `allocate` must be initialised (zero or previously
/// written bytes) so callers may view it as `[u8]`.
pub trait Allocator: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> AllocatorKind;

    /// Allocates `size` bytes, or `None` if neither this allocator nor its
    /// fallbacks can serve the request.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with
    /// the same `size` and not released since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);

    /// Size of the live allocation at `ptr`, when the allocator tracks it.
    fn size_of_allocation(&self, ptr: NonNull<u8>) -> Option<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
    }

    #[test]
    fn test_kind_names_are_distinct() {
        let kinds = [
            AllocatorKind::System,
            AllocatorKind::Stack,
            AllocatorKind::Pool,
            AllocatorKind::Monotonic,
            AllocatorKind::Inline,
            AllocatorKind::MultiPool,
            AllocatorKind::ThreadSafeMultiPool,
            AllocatorKind::Custom,
        ];
        let mut names: Vec<_> = kinds.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
    }
}
