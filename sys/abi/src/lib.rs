// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! This crate deliberately has no dependencies and no target-specific code,
//! so that host-side tools and tests can use the same vocabulary as the
//! kernel itself.

#![cfg_attr(not(test), no_std)]

/// Maximum number of tasks the kernel will manage, including the idle task.
///
/// Task control blocks are statically allocated, so this bounds the kernel's
/// RAM footprint. Task IDs are pool indices and must fit in a `u8`.
pub const MAX_TASKS: usize = 16;

/// Number of distinct scheduling priority levels. Valid priorities are
/// `0..NUM_PRIORITIES`, and the lowest level is reserved for the idle task.
pub const NUM_PRIORITIES: usize = 8;

/// Default stack size in bytes, used for kernel-internal tasks (currently
/// just the idle task) and suggested for applications that don't have a
/// better number.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Timeout value meaning "wait forever."
pub const INFINITE: u64 = u64::MAX;

/// Converts a count of microseconds into kernel time units (microseconds).
///
/// This exists for symmetry with `msec`/`sec`, so that call sites can spell
/// out which unit they mean.
pub const fn usec(us: u64) -> u64 {
    us
}

/// Converts a count of milliseconds into kernel time units (microseconds).
pub const fn msec(ms: u64) -> u64 {
    ms * 1_000
}

/// Converts a count of seconds into kernel time units (microseconds).
pub const fn sec(s: u64) -> u64 {
    s * 1_000_000
}

/// Errors returned by kernel operations.
///
/// The taxonomy is closed and flat: there is no chaining, and recovery is
/// always local to the caller. Each variant has a stable numeric code
/// (success is 0 by convention, represented by `Result::Ok` rather than a
/// variant) so the values can be shared with debuggers and non-Rust tooling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Error {
    /// An argument violates the operation's preconditions: out-of-range
    /// priority, unknown task ID, unlock by a non-owner, self-delete, and
    /// the like.
    Invalid = -1,
    /// The task pool is exhausted. This is the only allocation failure in
    /// the system.
    NoMem = -2,
    /// A finite wait expired before the operation could complete.
    Timeout = -3,
    /// Reserved for derived primitives; not produced by the kernel itself.
    Busy = -4,
    /// A blocking operation was attempted from interrupt context.
    IsrContext = -5,
    /// A semaphore was given beyond its maximum count.
    Overflow = -6,
}

impl Error {
    /// Returns the stable numeric code for this error.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Names a task by its slot in the task pool.
///
/// IDs are stable for the task's lifetime and are reused once a task has
/// been deleted, so holding a `TaskId` across a delete/create pair can name
/// a different task. (Applications that need to detect this should arrange
/// their shutdown order so they don't; the kernel does not track
/// generations.)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    /// Returns the pool index named by this ID, for indexing the task table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth. (This keeps our logic simpler
/// given that the number of priorities can be reconfigured.)
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub const fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Checks whether this is a priority level the kernel actually has a
    /// ready queue for.
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < NUM_PRIORITIES
    }
}

/// Scheduling state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// The task's pool slot is unused (never created, or deleted).
    #[default]
    Inactive,
    /// Runnable, queued at its priority level.
    Ready,
    /// Currently executing. Exactly one task is in this state once the
    /// kernel has started.
    Running,
    /// Waiting on a primitive's wait queue, the sleep list, or both.
    Blocked,
    /// Removed from scheduling until explicitly resumed.
    Suspended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        // These values are ABI; tooling relies on them.
        assert_eq!(Error::Invalid.code(), -1);
        assert_eq!(Error::NoMem.code(), -2);
        assert_eq!(Error::Timeout.code(), -3);
        assert_eq!(Error::Busy.code(), -4);
        assert_eq!(Error::IsrContext.code(), -5);
        assert_eq!(Error::Overflow.code(), -6);
    }

    #[test]
    fn time_literals() {
        assert_eq!(usec(7), 7);
        assert_eq!(msec(5), 5_000);
        assert_eq!(sec(2), 2_000_000);
    }

    #[test]
    fn priority_ordering_reads_correctly() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(3).is_more_important_than(Priority(3)));
        assert!(Priority(NUM_PRIORITIES as u8 - 1).is_valid());
        assert!(!Priority(NUM_PRIORITIES as u8).is_valid());
    }
}
