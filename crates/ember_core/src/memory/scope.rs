//! # Allocation Scope
//!
//! Per-thread stack of "current allocator" handles.
//!
//! A scope pushes a handle on construction and truncates the stack back to
//! its saved depth on drop, so the previous handle is restored on every
//! exit path, unwinding included. Scopes must nest: they are `!Send` and
//! cannot outlive the thread that created them.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::memory::registry::AllocatorHandle;

thread_local! {
    static CONTEXT: RefCell<AllocationContext> = const {
        RefCell::new(AllocationContext { stack: Vec::new() })
    };
}

struct AllocationContext {
    stack: Vec<AllocatorHandle>,
}

/// The handle allocations on this thread currently route to.
///
/// [`AllocatorHandle::SYSTEM`] when no scope is active (or the thread is
/// tearing down its locals).
#[must_use]
pub fn current_allocator() -> AllocatorHandle {
    CONTEXT
        .try_with(|ctx| ctx.borrow().stack.last().copied())
        .ok()
        .flatten()
        .unwrap_or(AllocatorHandle::SYSTEM)
}

/// Number of active scopes on this thread.
#[must_use]
pub fn scope_depth() -> usize {
    CONTEXT.try_with(|ctx| ctx.borrow().stack.len()).unwrap_or(0)
}

/// Runs `f` with `handle` as the current allocator.
pub fn with_allocator<R>(handle: AllocatorHandle, f: impl FnOnce() -> R) -> R {
    let _scope = AllocationScope::new(handle);
    f()
}

/// RAII guard making a handle current for its lifetime.
#[derive(Debug)]
#[must_use = "the previous allocator is restored as soon as the scope is dropped"]
pub struct AllocationScope {
    depth: usize,
    handle: AllocatorHandle,
    // Scopes are tied to the thread-local stack they pushed onto.
    _not_send: PhantomData<*const ()>,
}

impl AllocationScope {
    /// Makes `handle` current until the returned guard drops.
    pub fn new(handle: AllocatorHandle) -> Self {
        let depth = CONTEXT
            .try_with(|ctx| {
                let mut ctx = ctx.borrow_mut();
                let depth = ctx.stack.len();
                ctx.stack.push(handle);
                depth
            })
            .unwrap_or(0);

        Self {
            depth,
            handle,
            _not_send: PhantomData,
        }
    }

    /// Handle this scope made current.
    #[must_use]
    pub fn handle(&self) -> AllocatorHandle {
        self.handle
    }
}

impl Drop for AllocationScope {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| ctx.borrow_mut().stack.truncate(self.depth));
    }
}
