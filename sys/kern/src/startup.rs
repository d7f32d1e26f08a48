// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the kernel state singleton.
//!
//! All mutable kernel state -- the task table, the scheduler bookkeeping,
//! and the sleep list -- lives in one [`Kernel`] value guarded by the global
//! critical section. Code anywhere in the kernel gets at it through
//! [`kernel`], which hands out a `RefMut` scoped to the critical section the
//! caller already holds. The `RefCell` is never contended in practice
//! (uniprocessor, interrupts masked); it exists to make the exclusive-access
//! argument checkable instead of implicit.

use core::cell::{RefCell, RefMut};

use abi::{Priority, DEFAULT_STACK_SIZE, MAX_TASKS, NUM_PRIORITIES};
use critical_section::{CriticalSection, Mutex};

use crate::sched::{self, Sched};
use crate::task::{self, Task};
use crate::time::SleepList;

/// The kernel's entire mutable state.
pub(crate) struct Kernel {
    /// Task control blocks, indexed by task ID. Slot 0 is the idle task once
    /// [`init`] has run.
    pub tasks: [Task; MAX_TASKS],
    /// Ready queues, current task, scheduler lock.
    pub sched: Sched,
    /// Tasks with a pending wake deadline, sorted by wake time.
    pub sleep: SleepList,
}

impl Kernel {
    const INIT: Self = Self {
        tasks: [Task::INIT; MAX_TASKS],
        sched: Sched::INIT,
        sleep: SleepList::INIT,
    };
}

static KERNEL: Mutex<RefCell<Kernel>> = Mutex::new(RefCell::new(Kernel::INIT));

/// Borrows the kernel state within a critical section.
///
/// # Panics
///
/// Panics if kernel state is already borrowed, which would mean a kernel
/// routine re-entered the kernel while holding the state -- a bug, not a
/// runtime condition.
pub(crate) fn kernel(cs: CriticalSection<'_>) -> RefMut<'_, Kernel> {
    KERNEL.borrow_ref_mut(cs)
}

/// Stack for the idle task. Handed to `task::create` during [`init`];
/// nothing else touches it.
static mut IDLE_STACK: [u8; DEFAULT_STACK_SIZE] = [0; DEFAULT_STACK_SIZE];

fn idle_main(_arg: usize) {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// Initializes the kernel: resets the task table, starts the timekeeping
/// hardware, and creates the idle task at the lowest priority so that the
/// scheduler always has something to run.
///
/// `sys_clock_hz` is the frequency the timer hardware counts at; it must be
/// at least 1 MHz so the kernel can keep microsecond time.
///
/// Call this once, before any other kernel entry point. (Hosted test builds
/// call it repeatedly to reset the kernel between tests; on hardware there
/// is no reason to.)
pub fn init(sys_clock_hz: u32) {
    critical_section::with(|cs| {
        *kernel(cs) = Kernel::INIT;
    });

    crate::arch::timer_init(sys_clock_hz);

    // Safety: we create exactly one &mut to IDLE_STACK here, and the
    // previous one (if init is being re-run on a hosted build) is gone --
    // `create` primes the stack and keeps only its address afterwards.
    let stack = unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) };

    let r = task::create(
        "idle",
        idle_main,
        0,
        Priority(NUM_PRIORITIES as u8 - 1),
        stack,
    );
    if r.is_err() {
        // Without an idle task the scheduler has edge cases we've chosen
        // not to have. This can only happen if init is called on a corrupt
        // kernel image.
        crate::fail::die("cannot create idle task");
    }

    klog!("init: {} task slots, {} priorities", MAX_TASKS, NUM_PRIORITIES);
}

/// Starts the scheduler: picks the most important ready task, marks it
/// running, and enters it. Does not return.
///
/// # Panics
///
/// Panics if no task is ready, i.e. [`init`] has not run.
pub fn start() -> ! {
    klog!("starting first task");
    let first_save = critical_section::with(|cs| {
        let mut k = kernel(cs);
        let k = &mut *k;
        let first = match sched::pick_next(k) {
            Some(i) => i,
            None => crate::fail::die("start with no ready tasks"),
        };
        k.tasks[first].state = abi::TaskState::Running;
        k.sched.current = Some(first);
        core::ptr::addr_of_mut!(k.tasks[first].save)
    });

    // Safety: the pointer refers into the static task table; the RefCell
    // borrow above has ended, and nothing else runs between here and the
    // bootstrap (interrupts may fire but the first context switch can only
    // be requested after `current` is valid, which it now is).
    unsafe { crate::arch::start_first_task(&mut *first_save) }
}
