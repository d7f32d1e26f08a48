// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! A wakeup *is* the transfer of one unit: when `give` finds a waiter, it
//! hands the unit over directly and never increments `count`, so there is
//! no window in which a third task can poll the unit away from a waiter
//! that was just unblocked.

use core::cell::Cell;

use abi::{Error, INFINITE};

use crate::sched;
use crate::startup::kernel;
use crate::task::WaitResult;
use crate::time;
use crate::wait::WaitQueue;

/// Outcome of the lock-held half of a blocking operation: either it
/// finished, or the caller is now blocked and must reschedule and then run
/// the finish half once it resumes.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Step {
    Done,
    Blocked,
}

/// A counting semaphore. Caller-constructed; usable from a `static`.
///
/// `count` is signed to leave room for credit-counting extensions; the
/// kernel itself never drives it negative.
pub struct Semaphore {
    count: critical_section::Mutex<Cell<i32>>,
    max: i32,
    waiters: WaitQueue,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` units with capacity `max`.
    ///
    /// Requires `0 <= initial <= max` and `max >= 1`; violations are
    /// programming errors and panic (at compile time when constructing a
    /// `static`).
    pub const fn new(initial: i32, max: i32) -> Self {
        assert!(initial >= 0 && max >= 1 && initial <= max);
        Self {
            count: critical_section::Mutex::new(Cell::new(initial)),
            max,
            waiters: WaitQueue::INIT,
        }
    }

    /// Takes one unit, waiting up to `timeout` microseconds for one to
    /// appear. A zero timeout polls; [`INFINITE`] waits forever. From ISR
    /// context the call degrades to a poll, since an ISR cannot block.
    pub fn take(&self, timeout: u64) -> Result<(), Error> {
        let timeout = if crate::arch::in_isr() { 0 } else { timeout };
        match self.start_take(timeout)? {
            Step::Done => Ok(()),
            Step::Blocked => {
                sched::reschedule();
                self.finish_take()
            }
        }
    }

    /// The lock-held half of [`Self::take`]: grab a unit or join the wait
    /// queue.
    pub(crate) fn start_take(&self, timeout: u64) -> Result<Step, Error> {
        critical_section::with(|cs| {
            let mut k = kernel(cs);
            let count = self.count.borrow(cs);
            if count.get() > 0 {
                count.set(count.get() - 1);
                return Ok(Step::Done);
            }
            if timeout == 0 {
                return Err(Error::Timeout);
            }
            let wake_at =
                (timeout != INFINITE).then(|| time::now().plus_us(timeout));
            self.waiters.block_current(cs, &mut k, wake_at);
            Ok(Step::Blocked)
        })
    }

    /// The post-resume half of [`Self::take`]: find out why we woke up.
    pub(crate) fn finish_take(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut k = kernel(cs);
            let cur = k.sched.current.expect("wait finished with no task");
            match k.tasks[cur].wait_result {
                WaitResult::Granted => Ok(()),
                WaitResult::TimedOut => {
                    // The alarm woke us; a concurrent give may have raced
                    // it and detached us already, which remove tolerates.
                    self.waiters.remove(cs, &mut k, cur);
                    Err(Error::Timeout)
                }
            }
        })
    }

    /// Returns one unit. If a task is waiting, the unit transfers to the
    /// most important waiter; otherwise the count rises, up to the
    /// capacity (`Overflow` beyond it). Safe to call from ISR context.
    pub fn give(&self) -> Result<(), Error> {
        let woke = critical_section::with(|cs| {
            let mut k = kernel(cs);
            if self.waiters.wake_head(cs, &mut k).is_some() {
                return Ok(true);
            }
            let count = self.count.borrow(cs);
            if count.get() < self.max {
                count.set(count.get() + 1);
                Ok(false)
            } else {
                Err(Error::Overflow)
            }
        })?;
        if woke {
            sched::reschedule();
        }
        Ok(())
    }
}
