//! # Stream Affinity
//!
//! Which streams may pick a task up from the shared queue.

use std::fmt;

/// Index of the Main stream (runs on the host thread).
pub const MAIN_STREAM: usize = 0;

/// Index of the IO stream.
pub const IO_STREAM: usize = 1;

const BITS: usize = u64::BITS as usize;

/// 64-bit stream mask; a *set* bit marks a disallowed stream.
///
/// The default allows every stream. Indices past 63 are never allowed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskStreamAffinity {
    disallowed: u64,
}

impl TaskStreamAffinity {
    /// Allows every stream.
    #[must_use]
    pub const fn all() -> Self {
        Self { disallowed: 0 }
    }

    /// The default for compute work: every stream except Main and IO.
    #[must_use]
    pub const fn compute() -> Self {
        Self {
            disallowed: (1 << MAIN_STREAM) | (1 << IO_STREAM),
        }
    }

    /// Allows only `index`.
    #[must_use]
    pub const fn only(index: usize) -> Self {
        if index >= BITS {
            return Self { disallowed: u64::MAX };
        }
        Self { disallowed: !(1 << index) }
    }

    /// Rebuilds a mask from its raw disallowed bits.
    #[must_use]
    pub const fn from_bits(disallowed: u64) -> Self {
        Self { disallowed }
    }

    /// Raw disallowed bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.disallowed
    }

    /// Allows stream `index`.
    pub fn set(&mut self, index: usize) {
        if index < BITS {
            self.disallowed &= !(1 << index);
        }
    }

    /// Disallows stream `index`.
    pub fn unset(&mut self, index: usize) {
        if index < BITS {
            self.disallowed |= 1 << index;
        }
    }

    /// Returns true if stream `index` may run the task.
    #[must_use]
    pub const fn get(self, index: usize) -> bool {
        index < BITS && self.disallowed & (1 << index) == 0
    }
}

impl fmt::Debug for TaskStreamAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskStreamAffinity(allowed={:#018x})", !self.disallowed)
    }
}
