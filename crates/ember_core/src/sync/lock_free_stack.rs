//! # Lock-Free Intrusive Stack
//!
//! A Treiber stack over caller-owned nodes.
//!
//! ```text
//!   top ──> [node C] ──next──> [node B] ──next──> [node A] ──> null
//!
//!   push X:  X.next = top;  CAS(top: C -> X)   retry on contention
//!   pop:     n = top;       CAS(top: n -> n.next)
//! ```
//!
//! Nodes are borrowed for `'a` rather than owned, so a node another thread
//! just popped stays readable while a racing `pop` inspects its `next` link.
//! The stack never frees anything.
//!
//! ## ABA
//!
//! Not addressed: if a node is popped and pushed back while another thread
//! sits between reading `top` and its CAS, that thread may install a stale
//! `next`. Every pointer involved is still a live `&'a T`, so this can lose
//! or duplicate entries but never touches freed memory. Callers that
//! recycle nodes under contention need their own tagging.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A node that carries its own link.
pub trait Linked: Sized {
    /// The intrusive `next` pointer.
    fn next_link(&self) -> &AtomicPtr<Self>;
}

/// Lock-free LIFO of `&'a T` nodes.
pub struct LockFreeStack<'a, T: Linked> {
    top: AtomicPtr<T>,
    _nodes: PhantomData<&'a T>,
}

// SAFETY: the stack only hands out `&'a T`; sharing it across threads is
// sharing those references, which requires `T: Sync`.
unsafe impl<T: Linked + Sync> Send for LockFreeStack<'_, T> {}
// SAFETY: see above.
unsafe impl<T: Linked + Sync> Sync for LockFreeStack<'_, T> {}

impl<'a, T: Linked> LockFreeStack<'a, T> {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            top: AtomicPtr::new(ptr::null_mut()),
            _nodes: PhantomData,
        }
    }

    /// Returns true if the stack was empty at the time of the load.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    /// Pushes `node`.
    ///
    /// A node must not be pushed again while it is still on the stack.
    pub fn push(&self, node: &'a T) {
        let node_ptr = (node as *const T).cast_mut();
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            node.next_link().store(top, Ordering::Relaxed);
            match self
                .top
                .compare_exchange_weak(top, node_ptr, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => top = actual,
            }
        }
    }

    /// Pops the most recently pushed node, or `None` if the stack was
    /// observed empty.
    pub fn pop(&self) -> Option<&'a T> {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            // SAFETY: every non-null pointer stored in `top` came from a
            // `&'a T` passed to `push`, so it is valid for `'a`.
            let node = unsafe { top.as_ref() }?;
            let next = node.next_link().load(Ordering::Relaxed);
            match self
                .top
                .compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(node),
                Err(actual) => top = actual,
            }
        }
    }
}

impl<T: Linked> Default for LockFreeStack<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> fmt::Debug for LockFreeStack<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Ready-made node holding a value.
#[derive(Debug, Default)]
pub struct StackNode<T> {
    value: T,
    next: AtomicPtr<StackNode<T>>,
}

impl<T> StackNode<T> {
    /// Wraps `value` in an unlinked node.
    pub const fn new(value: T) -> Self {
        Self {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The carried value.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Linked for StackNode<T> {
    #[inline]
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}
