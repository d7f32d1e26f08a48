// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wait-queue primitive shared by all blocking IPC.
//!
//! A wait queue is a list of blocked tasks ordered by priority, most
//! important first, FIFO among equals. Keeping the queue sorted is what
//! lets `wake_head` hand a semaphore unit, mutex, or queue slot to the
//! most important waiter -- which priority inheritance depends on.
//!
//! The timeout path is the subtle part. A task blocked with a finite
//! timeout is linked here *and* on the sleep list. The alarm sweep readies
//! it with `TimedOut` but leaves it linked here, because only the blocking
//! call itself knows which queue it is on; the task unlinks itself when it
//! resumes. Between those two moments a peer operation may still pick the
//! task via [`WaitQueue::wake_head`] -- that wake wins, overwriting the
//! result with `Granted`, since the resource really was transferred. Both
//! sides are written to tolerate the overlap: `wake_head` will not ready a
//! task twice, and [`WaitQueue::remove`] tolerates a task that is no
//! longer queued.

use core::cell::Cell;

use abi::TaskState;
use critical_section::CriticalSection;

use crate::sched;
use crate::startup::Kernel;
use crate::task::WaitResult;
use crate::time::{self, Timestamp};

/// Head of one wait queue. Embedded in each primitive; the links run
/// through the TCBs' `wait_link` fields.
pub(crate) struct WaitQueue {
    head: critical_section::Mutex<Cell<Option<usize>>>,
}

impl WaitQueue {
    pub const INIT: Self = Self {
        head: critical_section::Mutex::new(Cell::new(None)),
    };

    fn head(&self, cs: CriticalSection<'_>) -> Option<usize> {
        self.head.borrow(cs).get()
    }

    fn set_head(&self, cs: CriticalSection<'_>, v: Option<usize>) {
        self.head.borrow(cs).set(v);
    }

    /// Blocks the current task on this queue, optionally with a deadline.
    ///
    /// The caller must follow up with `sched::reschedule` once it has left
    /// the critical section, and must check `wait_result` when the call
    /// resumes (removing itself from this queue on `TimedOut`).
    pub fn block_current(
        &self,
        cs: CriticalSection<'_>,
        k: &mut Kernel,
        wake_at: Option<Timestamp>,
    ) {
        let cur = k
            .sched
            .current
            .expect("blocking call with no current task");
        k.tasks[cur].state = TaskState::Blocked;
        k.tasks[cur].wait_result = WaitResult::Granted;
        self.insert(cs, k, cur);

        if let Some(deadline) = wake_at {
            k.tasks[cur].wake_time = Some(deadline);
            time::sleep_insert(k, cur);
            time::reprogram_alarm(k);
        }
    }

    /// Links a task into the queue in priority order, after any equals.
    fn insert(&self, cs: CriticalSection<'_>, k: &mut Kernel, index: usize) {
        let Kernel { tasks, .. } = k;
        let prio = tasks[index].priority.0;

        let mut prev: Option<usize> = None;
        let mut cursor = self.head(cs);
        while let Some(i) = cursor {
            if tasks[i].priority.0 > prio {
                break;
            }
            prev = cursor;
            cursor = tasks[i].wait_link;
        }

        tasks[index].wait_link = cursor;
        tasks[index].in_wait_queue = true;
        match prev {
            Some(p) => tasks[p].wait_link = Some(index),
            None => self.set_head(cs, Some(index)),
        }
    }

    /// Detaches the most important waiter, grants its wait, and readies it
    /// (unless the alarm got there first and it is already Ready). Returns
    /// the waiter so the caller can do primitive-specific bookkeeping.
    pub fn wake_head(
        &self,
        cs: CriticalSection<'_>,
        k: &mut Kernel,
    ) -> Option<usize> {
        let index = self.head(cs)?;
        self.set_head(cs, k.tasks[index].wait_link);
        k.tasks[index].wait_link = None;
        k.tasks[index].in_wait_queue = false;

        time::sleep_remove(k, index);
        k.tasks[index].wake_time = None;
        time::reprogram_alarm(k);

        k.tasks[index].wait_result = WaitResult::Granted;
        if k.tasks[index].state == TaskState::Blocked {
            sched::ready_push(k, index);
        }
        Some(index)
    }

    /// Unlinks a task from this queue if it is still there. Used by a
    /// timed-out task to take itself back out; by then a concurrent wake
    /// may already have detached it, so absence is fine.
    pub fn remove(
        &self,
        cs: CriticalSection<'_>,
        k: &mut Kernel,
        index: usize,
    ) {
        let Kernel { tasks, .. } = k;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head(cs);
        while let Some(i) = cursor {
            if i == index {
                let next = tasks[i].wait_link;
                match prev {
                    Some(p) => tasks[p].wait_link = next,
                    None => self.set_head(cs, next),
                }
                tasks[i].wait_link = None;
                tasks[i].in_wait_queue = false;
                return;
            }
            prev = cursor;
            cursor = tasks[i].wait_link;
        }
    }

    /// True if any task is waiting.
    pub fn has_waiters(&self, cs: CriticalSection<'_>) -> bool {
        self.head(cs).is_some()
    }
}
