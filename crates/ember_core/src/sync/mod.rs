//! # Synchronization Primitives
//!
//! Lock-free building blocks shared by the runtime.
//!
//! ## The Problem
//!
//! ```text
//! Thread 1:  push(node)
//! Thread 2:  pop()
//!
//! With Mutex:  every hand-off pays for a lock, contention stalls streams
//! With CAS:    a failed exchange just retries with the fresh top
//! ```

mod lock_free_stack;

pub use lock_free_stack::{Linked, LockFreeStack, StackNode};
