// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: per-priority ready queues and the reschedule commit point.
//!
//! Scheduling is strictly fixed-priority and preemptive. Each priority
//! level keeps a FIFO of ready tasks, linked through the TCBs' `ready_link`
//! field; the scheduler always runs the head of the most important
//! non-empty level. Same-priority tasks rotate only when one yields or
//! blocks -- there is no time slicing.
//!
//! [`reschedule`] is the commit point. It decides who runs next under the
//! kernel lock and *requests* the context switch; the arch layer performs
//! the switch at the lowest interrupt priority, once the lock is released
//! and any pending ISRs have been delivered. Code in here therefore never
//! observes a half-switched CPU.

use abi::{TaskState, NUM_PRIORITIES};

use crate::startup::{kernel, Kernel};
use crate::task::Task;

/// One priority level's FIFO of ready tasks.
#[derive(Copy, Clone)]
pub(crate) struct ReadyQueue {
    pub(crate) head: Option<usize>,
    pub(crate) tail: Option<usize>,
}

impl ReadyQueue {
    const EMPTY: Self = Self {
        head: None,
        tail: None,
    };
}

/// Scheduler bookkeeping, part of the kernel state singleton.
pub(crate) struct Sched {
    pub ready: [ReadyQueue; NUM_PRIORITIES],
    /// Index of the running task; `None` only before the scheduler starts.
    pub current: Option<usize>,
    /// Nesting depth of the scheduler lock. While nonzero, reschedule
    /// requests are ignored; the lock's final release performs one.
    pub lock_depth: u32,
}

impl Sched {
    pub const INIT: Self = Self {
        ready: [ReadyQueue::EMPTY; NUM_PRIORITIES],
        current: None,
        lock_depth: 0,
    };
}

/// Appends a task to the tail of its priority level and marks it Ready.
pub(crate) fn ready_push(k: &mut Kernel, index: usize) {
    let Kernel { tasks, sched, .. } = k;
    let task = &mut tasks[index];
    task.state = TaskState::Ready;
    task.ready_link = None;
    let level = task.priority.0 as usize;

    let q = &mut sched.ready[level];
    match q.tail {
        Some(t) => tasks[t].ready_link = Some(index),
        None => q.head = Some(index),
    }
    q.tail = Some(index);
}

/// Unlinks a task from its priority level's ready queue. Does nothing if
/// the task isn't there.
pub(crate) fn ready_remove(k: &mut Kernel, index: usize) {
    let Kernel { tasks, sched, .. } = k;
    let level = tasks[index].priority.0 as usize;
    let q = &mut sched.ready[level];

    let mut prev: Option<usize> = None;
    let mut cursor = q.head;
    while let Some(i) = cursor {
        if i == index {
            let next = tasks[i].ready_link;
            match prev {
                Some(p) => tasks[p].ready_link = next,
                None => q.head = next,
            }
            if q.tail == Some(i) {
                q.tail = prev;
            }
            tasks[i].ready_link = None;
            return;
        }
        prev = cursor;
        cursor = tasks[i].ready_link;
    }
}

/// Unlinks and returns the head of the most important non-empty ready
/// queue, or `None` if nothing is ready.
pub(crate) fn pick_next(k: &mut Kernel) -> Option<usize> {
    let Kernel { tasks, sched, .. } = k;
    for q in sched.ready.iter_mut() {
        if let Some(head) = q.head {
            q.head = tasks[head].ready_link;
            if q.head.is_none() {
                q.tail = None;
            }
            tasks[head].ready_link = None;
            return Some(head);
        }
    }
    None
}

/// Gets `&mut` to two distinct tasks in the table at once.
fn pair_mut(tasks: &mut [Task], a: usize, b: usize) -> (&mut Task, &mut Task) {
    uassert!(a != b);
    if a < b {
        let (lo, hi) = tasks.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = tasks.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

/// The reschedule commit point, for callers already inside the kernel
/// lock.
///
/// The running task is re-queued at the tail of its level *before* the
/// pick, so a yield rotates among equals but never hands the CPU to a less
/// important task. If the pick lands on the running task itself, the move
/// is undone and no switch is requested.
pub(crate) fn reschedule_in(k: &mut Kernel) {
    if k.sched.lock_depth > 0 {
        return;
    }
    let Some(cur) = k.sched.current else {
        // Tasks may become ready before the scheduler starts; there is
        // nothing to switch away from yet.
        return;
    };

    if k.tasks[cur].state == TaskState::Running {
        ready_push(k, cur);
    }

    let Some(next) = pick_next(k) else {
        // Nothing ready anywhere. Once the idle task exists this is
        // unreachable; before that (hosted tests), keep running.
        return;
    };

    if next == cur {
        k.tasks[cur].state = TaskState::Running;
        return;
    }

    k.tasks[next].state = TaskState::Running;
    k.sched.current = Some(next);

    let (prev_task, next_task) = pair_mut(&mut k.tasks, cur, next);
    crate::arch::pend_switch(&mut prev_task.save, &mut next_task.save);
}

/// Re-evaluates scheduling and requests a context switch if a more
/// important task (or an equal one, if the caller is yielding) should run.
pub fn reschedule() {
    critical_section::with(|cs| {
        let mut k = kernel(cs);
        reschedule_in(&mut k);
    });
}

/// Gives up the CPU to the next task of equal priority, if any. The caller
/// re-enters the tail of its priority level.
pub fn yield_now() {
    reschedule();
}

/// Takes the scheduler lock, deferring all context switches until the
/// matching [`unlock`]. Nestable. Interrupts still run; only the switch is
/// held back.
pub fn lock() {
    critical_section::with(|cs| {
        kernel(cs).sched.lock_depth += 1;
    });
}

/// Releases the scheduler lock. When the depth returns to zero, performs
/// the reschedule that was deferred.
pub fn unlock() {
    let depth = critical_section::with(|cs| {
        let mut k = kernel(cs);
        if k.sched.lock_depth > 0 {
            k.sched.lock_depth -= 1;
        }
        k.sched.lock_depth
    });
    if depth == 0 {
        reschedule();
    }
}
