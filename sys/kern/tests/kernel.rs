// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Public-API scenarios, run against the hosted port.
//!
//! These cover what an application can observe without tasks actually
//! executing (the hosted port never switches stacks): object lifecycle,
//! polling-mode IPC, ordering, and the error taxonomy. The blocking
//! machinery itself is exercised by the unit tests inside the kernel,
//! which can drive the scheduler's bookkeeping directly.

use std::sync::{Mutex, MutexGuard, PoisonError};

use abi::{Error, Priority, TaskId, TaskState, MAX_TASKS};
use kern::mqueue::MessageQueue;
use kern::sem::Semaphore;

/// The kernel is a process-wide singleton, so tests take turns. `init`
/// resets it completely.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn fresh_kernel() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    kern::startup::init(16_000_000);
    guard
}

fn stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; 256].into_boxed_slice())
}

fn noop(_arg: usize) {}

#[test]
fn init_brings_up_the_idle_task() {
    let _guard = fresh_kernel();
    // Slot 0 is the idle task, ready at the lowest priority.
    assert_eq!(kern::task::state(TaskId(0)), Ok(TaskState::Ready));
    // With no task running yet, the kernel self-identifies as idle.
    assert_eq!(kern::task::current_id(), TaskId(0));
}

#[test]
fn task_pool_hands_out_ids_then_nomem() {
    let _guard = fresh_kernel();
    for i in 1..MAX_TASKS {
        let id = kern::task::create("t", noop, 0, Priority(3), stack())
            .unwrap();
        assert_eq!(id.index(), i);
    }
    assert_eq!(
        kern::task::create("t", noop, 0, Priority(3), stack()),
        Err(Error::NoMem)
    );

    // Deleting one brings the pool back under its limit.
    kern::task::delete(TaskId(5)).unwrap();
    assert_eq!(kern::task::state(TaskId(5)), Err(Error::Invalid));
    let id = kern::task::create("t", noop, 0, Priority(3), stack()).unwrap();
    assert_eq!(id, TaskId(5));
}

#[test]
fn task_info_reflects_the_tcb() {
    let _guard = fresh_kernel();
    let stack = stack();
    let stack_base = stack.as_ptr() as usize;
    let t = kern::task::create("worker", noop, 17, Priority(2), stack)
        .unwrap();

    let info = kern::task::info(t).unwrap();
    assert_eq!(info.name, "worker");
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.priority, Priority(2));
    assert_eq!(info.base_priority, Priority(2));
    assert_eq!(info.stack_base, stack_base);
    assert_eq!(info.stack_size, 256);
    assert_eq!(info.arg, 17);
    assert!(info.entry.is_some());
    // The idle task self-describes too.
    assert_eq!(kern::task::info(TaskId(0)).unwrap().name, "idle");
}

#[test]
fn suspend_resume_restores_readiness() {
    let _guard = fresh_kernel();
    let t = kern::task::create("t", noop, 0, Priority(2), stack()).unwrap();

    kern::task::suspend(t).unwrap();
    assert_eq!(kern::task::state(t), Ok(TaskState::Suspended));
    kern::task::resume(t).unwrap();
    assert_eq!(kern::task::state(t), Ok(TaskState::Ready));
}

#[test]
fn semaphore_counts_and_overflows() {
    let _guard = fresh_kernel();
    static SEM: Semaphore = Semaphore::new(1, 3);

    // initial=1 plus two gives fills it to max...
    SEM.give().unwrap();
    SEM.give().unwrap();
    // ...then gives overflow, and exactly three takes succeed.
    assert_eq!(SEM.give(), Err(Error::Overflow));
    assert_eq!(SEM.take(0), Ok(()));
    assert_eq!(SEM.take(0), Ok(()));
    assert_eq!(SEM.take(0), Ok(()));
    assert_eq!(SEM.take(0), Err(Error::Timeout));

    // Put one back so a re-run of this binary's tests (same static!)
    // can't be surprised: the pair leaves the count where it started.
    SEM.give().unwrap();
    assert_eq!(SEM.take(0), Ok(()));
}

#[test]
fn message_queue_preserves_send_order() {
    let _guard = fresh_kernel();
    let q = MessageQueue::new(
        Box::leak(vec![0u8; 8 * 4].into_boxed_slice()),
        8,
        4,
    )
    .unwrap();

    for i in 0u8..4 {
        let msg = [i; 8];
        q.send(&msg, 0).unwrap();
    }
    // Full queue, polling sender backs off.
    assert_eq!(q.send(&[9u8; 8], 0), Err(Error::Timeout));

    let mut out = [0u8; 8];
    for i in 0u8..4 {
        q.recv(&mut out, 0).unwrap();
        assert_eq!(out, [i; 8]);
    }
    assert_eq!(q.recv(&mut out, 0), Err(Error::Timeout));
}

#[test]
fn message_queue_rejects_misfit_payloads() {
    let _guard = fresh_kernel();
    let q = MessageQueue::new(
        Box::leak(vec![0u8; 16].into_boxed_slice()),
        4,
        4,
    )
    .unwrap();
    assert_eq!(q.send(&[0u8; 3], 0), Err(Error::Invalid));
    let mut out = [0u8; 5];
    assert_eq!(q.recv(&mut out, 0), Err(Error::Invalid));
}

#[test]
fn uptime_follows_the_clock() {
    let _guard = fresh_kernel();
    assert_eq!(kern::time::uptime_us(), 0);
    kern::arch::set_time(abi::msec(5));
    assert_eq!(kern::time::uptime_us(), 5_000);
}

#[test]
fn scheduler_lock_nests() {
    let _guard = fresh_kernel();
    // No tasks running; this just must not wedge or underflow.
    kern::sched::lock();
    kern::sched::lock();
    kern::sched::unlock();
    kern::sched::unlock();
    kern::sched::unlock(); // extra unlock is tolerated
    kern::sched::yield_now();
}
