// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks and task lifecycle.
//!
//! Tasks live in a fixed pool inside the kernel state; a task's ID is its
//! pool index, stable for the task's lifetime. Slots whose state is
//! `Inactive` are free, and are claimed in index order, so deleting a task
//! makes its slot (and ID) reusable.

use abi::{Error, Priority, TaskId, TaskState, MAX_TASKS};

use crate::sched;
use crate::startup::{kernel, Kernel};
use crate::time::Timestamp;

/// The fewest bytes of stack we'll accept for a new task: enough for the
/// synthesized initial frame plus a little room to actually run.
pub const MIN_STACK_SIZE: usize = 128;

/// Why a blocked task was resumed. Every blocking operation inspects this
/// after it gets the CPU back to decide what to return.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WaitResult {
    /// A peer operation woke us and transferred whatever was being waited
    /// for (a semaphore unit, mutex ownership, queue space).
    Granted,
    /// The wait deadline passed and the alarm woke us instead.
    TimedOut,
}

/// A task control block.
///
/// The fields of this struct are `pub(crate)` rather than `pub`: the
/// scheduler, timer, and wait-queue modules all cooperate to maintain the
/// list invariants, but nothing outside the kernel gets to poke at them.
#[repr(C)]
pub(crate) struct Task {
    /// Saved machine state while the task is not running.
    // NOTE: it is critical that this field appear first! The context-switch
    // trampoline addresses the saved stack pointer through a pointer to the
    // TCB.
    pub save: crate::arch::SavedState,

    pub state: TaskState,
    /// Effective scheduling priority. Transiently raised by priority
    /// inheritance.
    pub priority: Priority,
    /// The priority this task had before any inheritance boost; maintained
    /// by the mutex layer and restored on unlock.
    pub base_priority: Priority,
    /// Diagnostic only.
    pub name: &'static str,

    /// Caller-owned stack region, recorded for diagnostics. The kernel
    /// touches the memory itself only once, to prime the initial frame.
    pub stack_base: usize,
    pub stack_size: usize,

    /// Entry point and its argument, used only at stack priming.
    pub entry: Option<fn(usize)>,
    pub arg: usize,

    /// Absolute wake deadline while on the sleep list.
    pub wake_time: Option<Timestamp>,
    /// Reserved for a future tick-driven time-slicing policy; nothing
    /// reads it yet.
    #[allow(dead_code)]
    pub rr_remaining: u16,
    /// Outcome of the most recent blocking wait.
    pub wait_result: WaitResult,

    /// Successor in the ready queue.
    pub ready_link: Option<usize>,
    /// Successor in a primitive's wait queue, plus a flag saying whether
    /// we're in one (a `None` link is also the tail position, so the link
    /// alone can't tell).
    ///
    /// Each list membership gets its own link on purpose. A task blocked
    /// with a timeout is on a wait queue and the sleep list at once; and
    /// when the alarm readies it, it is on the ready queue while *still*
    /// linked in the wait queue, until its blocking call resumes and
    /// unlinks it. Sharing links across those memberships corrupts
    /// whichever list loses the race.
    pub wait_link: Option<usize>,
    pub in_wait_queue: bool,
    /// Successor in the sleep list.
    pub sleep_link: Option<usize>,
}

impl Task {
    pub const INIT: Self = Self {
        save: crate::arch::SavedState::INIT,
        state: TaskState::Inactive,
        priority: Priority(0),
        base_priority: Priority(0),
        name: "",
        stack_base: 0,
        stack_size: 0,
        entry: None,
        arg: 0,
        wake_time: None,
        rr_remaining: 0,
        wait_result: WaitResult::Granted,
        ready_link: None,
        wait_link: None,
        in_wait_queue: false,
        sleep_link: None,
    };
}

/// Checks a caller-provided task ID, returning a table index that is in
/// range and names a live task.
pub(crate) fn check_id(k: &Kernel, id: TaskId) -> Result<usize, Error> {
    let index = id.index();
    if index >= MAX_TASKS || k.tasks[index].state == TaskState::Inactive {
        return Err(Error::Invalid);
    }
    Ok(index)
}

/// Creates a task and makes it ready.
///
/// `stack` is owned by the caller for the life of the task; the kernel
/// primes it with an initial frame so that the first context switch into
/// the task lands in `entry(arg)`. If `entry` ever returns, the task lands
/// in a halt trap rather than wandering off the end of its stack.
///
/// Errors: `Invalid` for a bad priority or an undersized stack, `NoMem`
/// when the task pool is exhausted.
pub fn create(
    name: &'static str,
    entry: fn(usize),
    arg: usize,
    priority: Priority,
    stack: &'static mut [u8],
) -> Result<TaskId, Error> {
    if !priority.is_valid() || stack.len() < MIN_STACK_SIZE {
        return Err(Error::Invalid);
    }

    let id = critical_section::with(|cs| {
        let mut k = kernel(cs);
        let index = k
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Inactive)
            .ok_or(Error::NoMem)?;

        let sp = crate::arch::prime_stack(stack, entry, arg);

        let task = &mut k.tasks[index];
        *task = Task::INIT;
        task.save.set_stack_pointer(sp);
        task.priority = priority;
        task.base_priority = priority;
        task.name = name;
        task.stack_base = stack.as_ptr() as usize;
        task.stack_size = stack.len();
        task.entry = Some(entry);
        task.arg = arg;

        sched::ready_push(&mut k, index);
        Ok(TaskId(index as u8))
    })?;

    // If the new task outranks the running one, let it in. Before the
    // scheduler has started this is a no-op.
    sched::reschedule();
    Ok(id)
}

/// Suspends a task, removing it from scheduling until [`resume`].
///
/// Only Ready, Running, or already-Suspended tasks can be suspended: a
/// Blocked task is linked into some primitive's wait queue, which the
/// kernel cannot reach from here, so suspending it returns `Invalid`.
pub fn suspend(id: TaskId) -> Result<(), Error> {
    let was_current = critical_section::with(|cs| {
        let mut k = kernel(cs);
        let index = check_id(&k, id)?;
        match k.tasks[index].state {
            TaskState::Ready => {
                sched::ready_remove(&mut k, index);
                k.tasks[index].state = TaskState::Suspended;
                Ok(false)
            }
            TaskState::Running => {
                // The task keeps the CPU until the reschedule below; it is
                // not on any queue, so there is nothing to unlink.
                k.tasks[index].state = TaskState::Suspended;
                Ok(true)
            }
            TaskState::Suspended => Ok(false),
            TaskState::Blocked | TaskState::Inactive => Err(Error::Invalid),
        }
    })?;

    if was_current {
        sched::reschedule();
    }
    Ok(())
}

/// Makes a suspended task ready again, at the tail of its priority level.
pub fn resume(id: TaskId) -> Result<(), Error> {
    critical_section::with(|cs| {
        let mut k = kernel(cs);
        let index = check_id(&k, id)?;
        if k.tasks[index].state != TaskState::Suspended {
            return Err(Error::Invalid);
        }
        sched::ready_push(&mut k, index);
        Ok(())
    })?;

    sched::reschedule();
    Ok(())
}

/// Deletes a task, returning its pool slot (and stack, which the caller
/// owns anyway) for reuse.
///
/// A task may not delete itself, and a task still linked into some
/// primitive's wait queue -- Blocked, or readied by a timeout but not yet
/// resumed -- may not be deleted, because the kernel cannot unlink it
/// from a queue it cannot name. Both return `Invalid`.
pub fn delete(id: TaskId) -> Result<(), Error> {
    critical_section::with(|cs| {
        let mut k = kernel(cs);
        let index = check_id(&k, id)?;
        if k.sched.current == Some(index) || k.tasks[index].in_wait_queue {
            return Err(Error::Invalid);
        }
        match k.tasks[index].state {
            TaskState::Ready => sched::ready_remove(&mut k, index),
            TaskState::Suspended => (),
            // Running is current (rejected above); Inactive failed check_id.
            _ => return Err(Error::Invalid),
        }
        k.tasks[index] = Task::INIT;
        Ok(())
    })
}

/// Returns the ID of the calling task.
///
/// Before the scheduler has started (or from an ISR that interrupted the
/// startup path) this reports the idle task, ID 0.
pub fn current_id() -> TaskId {
    critical_section::with(|cs| {
        let k = kernel(cs);
        TaskId(k.sched.current.unwrap_or(0) as u8)
    })
}

/// Reports a task's scheduling state. `Invalid` if `id` names no task.
pub fn state(id: TaskId) -> Result<TaskState, Error> {
    critical_section::with(|cs| {
        let k = kernel(cs);
        let index = check_id(&k, id)?;
        Ok(k.tasks[index].state)
    })
}

/// Diagnostic snapshot of a task, for shells and debuggers. A copy, not a
/// view; it can be stale the moment it's returned.
#[derive(Copy, Clone, Debug)]
pub struct TaskInfo {
    pub name: &'static str,
    pub state: TaskState,
    pub priority: Priority,
    pub base_priority: Priority,
    pub stack_base: usize,
    pub stack_size: usize,
    /// Saved stack pointer, meaningful only while the task isn't running.
    pub stack_pointer: u32,
    pub entry: Option<fn(usize)>,
    pub arg: usize,
}

/// Reads out a task's diagnostic snapshot. `Invalid` if `id` names no
/// task.
pub fn info(id: TaskId) -> Result<TaskInfo, Error> {
    critical_section::with(|cs| {
        let k = kernel(cs);
        let index = check_id(&k, id)?;
        let t = &k.tasks[index];
        Ok(TaskInfo {
            name: t.name,
            state: t.state,
            priority: t.priority,
            base_priority: t.base_priority,
            stack_base: t.stack_base,
            stack_size: t.stack_size,
            stack_pointer: t.save.stack_pointer(),
            entry: t.entry,
            arg: t.arg,
        })
    })
}
