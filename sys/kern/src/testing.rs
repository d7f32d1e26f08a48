// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the kernel's host-side tests.
//!
//! The kernel state is a process-wide singleton and the test harness runs
//! tests on several threads, so every test grabs [`fresh_kernel`]: a
//! process-global lock plus a full `startup::init`, which resets the task
//! pool, the simulated clock, and the recorded alarm. Tasks spawned here
//! never actually run -- the hosted port doesn't switch stacks -- so tests
//! drive scheduling decisions directly and read the results out of the
//! task table.

use std::sync::{Mutex, MutexGuard, PoisonError};

use abi::{Priority, TaskState};

use crate::sched;
use crate::startup::kernel;

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes the caller against every other kernel test and resets the
/// kernel (16 MHz nominal clock, like the reference target). Hold the
/// guard for the whole test.
pub(crate) fn fresh_kernel() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    crate::startup::init(16_000_000);
    guard
}

/// A leaked, test-sized task stack.
pub(crate) fn stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; 256].into_boxed_slice())
}

/// A stack too small to hold even the initial frame.
pub(crate) fn tiny_stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; 16].into_boxed_slice())
}

/// Creates a ready task and returns its table index.
pub(crate) fn spawn(name: &'static str, priority: Priority) -> usize {
    crate::task::create(name, |_| {}, 0, priority, stack())
        .expect("spawn failed")
        .index()
}

/// Forcibly installs a task as the running one, the way the scheduler
/// would have after switching to it. Any previously "running" task is
/// simply deposed, which is fine for tests that don't look at it.
pub(crate) fn make_current(index: usize) {
    critical_section::with(|cs| {
        let mut k = kernel(cs);
        sched::ready_remove(&mut k, index);
        k.tasks[index].state = TaskState::Running;
        k.sched.current = Some(index);
    });
}

/// Index of the task the scheduler believes is running.
pub(crate) fn current() -> usize {
    critical_section::with(|cs| {
        kernel(cs).sched.current.expect("no current task")
    })
}

pub(crate) fn task_state(index: usize) -> TaskState {
    critical_section::with(|cs| kernel(cs).tasks[index].state)
}

pub(crate) fn task_priority(index: usize) -> Priority {
    critical_section::with(|cs| kernel(cs).tasks[index].priority)
}

/// The ready queue at `level`, head first.
pub(crate) fn ready_order(level: usize) -> Vec<usize> {
    critical_section::with(|cs| {
        let k = kernel(cs);
        let mut order = Vec::new();
        let mut cursor = k.sched.ready[level].head;
        while let Some(i) = cursor {
            order.push(i);
            cursor = k.tasks[i].ready_link;
        }
        order
    })
}
