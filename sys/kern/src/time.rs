// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the microsecond clock, the sleep list, and the alarm.
//!
//! The kernel is tickless in the scheduling sense: there is no periodic
//! scheduler interrupt, just one hardware alarm that is always programmed
//! for the earliest pending deadline (or disarmed when there is none).
//! Sleeping tasks sit on a single list sorted by absolute wake time, linked
//! through the TCBs' dedicated `sleep_link` field -- a task blocked with a
//! timeout is on a wait queue *and* this list simultaneously, which is why
//! the two memberships use separate links.

use abi::TaskState;

use crate::sched;
use crate::startup::{kernel, Kernel};
use crate::task::WaitResult;

/// In-kernel timestamp: microseconds since `startup::init`, 64 bits, never
/// decreasing. At a microsecond per count this does not wrap in any
/// deployment we care to imagine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns this timestamp moved `us` microseconds into the future,
    /// saturating rather than wrapping (an `INFINITE` offset stays a
    /// far-future deadline instead of becoming the past).
    pub(crate) fn plus_us(self, us: u64) -> Self {
        Timestamp(self.0.saturating_add(us))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Reads the current kernel time.
pub(crate) fn now() -> Timestamp {
    Timestamp(crate::arch::now_us())
}

/// Microseconds since the kernel was initialized.
pub fn uptime_us() -> u64 {
    crate::arch::now_us()
}

/// Head of the sleep list, part of the kernel state singleton. Sorted by
/// `wake_time`, soonest first; ties keep insertion order.
pub(crate) struct SleepList {
    head: Option<usize>,
}

impl SleepList {
    pub const INIT: Self = Self { head: None };
}

/// Links a task into the sleep list by its `wake_time`. The caller has
/// already set `wake_time`.
pub(crate) fn sleep_insert(k: &mut Kernel, index: usize) {
    let Kernel { tasks, sleep, .. } = k;
    let deadline = tasks[index].wake_time;

    let mut prev: Option<usize> = None;
    let mut cursor = sleep.head;
    while let Some(i) = cursor {
        if tasks[i].wake_time > deadline {
            break;
        }
        prev = cursor;
        cursor = tasks[i].sleep_link;
    }

    tasks[index].sleep_link = cursor;
    match prev {
        Some(p) => tasks[p].sleep_link = Some(index),
        None => sleep.head = Some(index),
    }
}

/// Unlinks a task from the sleep list, if present.
pub(crate) fn sleep_remove(k: &mut Kernel, index: usize) {
    let Kernel { tasks, sleep, .. } = k;
    let mut prev: Option<usize> = None;
    let mut cursor = sleep.head;
    while let Some(i) = cursor {
        if i == index {
            let next = tasks[i].sleep_link;
            match prev {
                Some(p) => tasks[p].sleep_link = next,
                None => sleep.head = next,
            }
            tasks[i].sleep_link = None;
            return;
        }
        prev = cursor;
        cursor = tasks[i].sleep_link;
    }
}

/// Re-arms (or disarms) the hardware alarm to match the sleep list head.
/// Called after every mutation that can change the head.
pub(crate) fn reprogram_alarm(k: &mut Kernel) {
    match k.sleep.head {
        Some(i) => {
            let deadline = k.tasks[i]
                .wake_time
                .expect("sleeper with no deadline");
            crate::arch::set_alarm(deadline.into());
        }
        None => crate::arch::cancel_alarm(),
    }
}

/// Blocks the calling task for at least `us` microseconds.
///
/// A zero sleep is just a yield. Called from an ISR, this does nothing --
/// there is no task context to put to sleep.
pub fn sleep_us(us: u64) {
    if crate::arch::in_isr() {
        return;
    }
    if us == 0 {
        sched::yield_now();
        return;
    }

    critical_section::with(|cs| {
        let mut k = kernel(cs);
        let Some(cur) = k.sched.current else {
            // Sleeping before the scheduler starts would hang forever;
            // treat it as a no-op instead.
            return;
        };
        k.tasks[cur].state = TaskState::Blocked;
        k.tasks[cur].wake_time = Some(now().plus_us(us));
        sleep_insert(&mut k, cur);
        reprogram_alarm(&mut k);
        sched::reschedule_in(&mut k);
    });
}

/// Blocks the calling task for at least `ms` milliseconds.
pub fn sleep_ms(ms: u32) {
    sleep_us(abi::msec(ms as u64));
}

/// Blocks the calling task for at least `s` seconds.
pub fn sleep_s(s: u32) {
    sleep_us(abi::sec(s as u64));
}

/// The alarm has fired: wake everything whose deadline has arrived.
///
/// Runs in ISR context on hardware. Each expired sleeper is readied with
/// `TimedOut`; if it was also on a primitive's wait queue, it stays there
/// -- the task unlinks itself when its blocking call resumes, which is the
/// only place that knows which queue it was on. One reschedule at the end
/// lets the most important woken task preempt whatever was interrupted.
pub(crate) fn handle_alarm() {
    critical_section::with(|cs| {
        let mut k = kernel(cs);
        let now = now();

        loop {
            let Some(head) = k.sleep.head else { break };
            let Some(deadline) = k.tasks[head].wake_time else { break };
            if deadline > now {
                break;
            }
            k.sleep.head = k.tasks[head].sleep_link;
            k.tasks[head].sleep_link = None;
            k.tasks[head].wake_time = None;
            k.tasks[head].wait_result = WaitResult::TimedOut;
            if k.tasks[head].state == TaskState::Blocked {
                sched::ready_push(&mut k, head);
            }
        }

        reprogram_alarm(&mut k);
        sched::reschedule_in(&mut k);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use abi::{Priority, TaskId};

    fn sleep_task(k: &mut Kernel, index: usize, at: u64) {
        k.tasks[index].state = TaskState::Blocked;
        k.tasks[index].wake_time = Some(Timestamp(at));
        sleep_insert(k, index);
        reprogram_alarm(k);
    }

    fn sleep_order(k: &Kernel) -> Vec<usize> {
        let mut order = Vec::new();
        let mut cursor = k.sleep.head;
        while let Some(i) = cursor {
            order.push(i);
            cursor = k.tasks[i].sleep_link;
        }
        order
    }

    #[test]
    fn sleep_list_stays_sorted_with_fifo_ties() {
        let _guard = testing::fresh_kernel();
        let a = testing::spawn("a", Priority(2));
        let b = testing::spawn("b", Priority(2));
        let c = testing::spawn("c", Priority(2));
        let d = testing::spawn("d", Priority(2));

        critical_section::with(|cs| {
            let mut k = kernel(cs);
            for t in [a, b, c, d] {
                sched::ready_remove(&mut k, t);
            }
            sleep_task(&mut k, a, 500);
            sleep_task(&mut k, b, 100);
            sleep_task(&mut k, c, 500);
            sleep_task(&mut k, d, 300);
            // b first; a and c tie at 500 and keep insertion order.
            assert_eq!(sleep_order(&k), vec![b, d, a, c]);
        });
    }

    #[test]
    fn alarm_tracks_the_list_head() {
        let _guard = testing::fresh_kernel();
        let a = testing::spawn("a", Priority(2));
        let b = testing::spawn("b", Priority(2));

        critical_section::with(|cs| {
            let mut k = kernel(cs);
            sched::ready_remove(&mut k, a);
            sched::ready_remove(&mut k, b);

            sleep_task(&mut k, a, 800);
            assert_eq!(crate::arch::armed_alarm(), Some(800));
            sleep_task(&mut k, b, 200);
            assert_eq!(crate::arch::armed_alarm(), Some(200));

            sleep_remove(&mut k, b);
            reprogram_alarm(&mut k);
            assert_eq!(crate::arch::armed_alarm(), Some(800));
            sleep_remove(&mut k, a);
            reprogram_alarm(&mut k);
            assert_eq!(crate::arch::armed_alarm(), None);
        });
    }

    #[test]
    fn alarm_sweep_wakes_everything_due() {
        let _guard = testing::fresh_kernel();
        let a = testing::spawn("a", Priority(2));
        let b = testing::spawn("b", Priority(2));
        let c = testing::spawn("c", Priority(2));

        critical_section::with(|cs| {
            let mut k = kernel(cs);
            for t in [a, b, c] {
                sched::ready_remove(&mut k, t);
            }
            sleep_task(&mut k, a, 100);
            sleep_task(&mut k, b, 250);
            sleep_task(&mut k, c, 9_000);
        });

        crate::arch::set_time(300);
        handle_alarm();

        assert_eq!(crate::task::state(TaskId(a as u8)), Ok(TaskState::Ready));
        assert_eq!(crate::task::state(TaskId(b as u8)), Ok(TaskState::Ready));
        assert_eq!(
            crate::task::state(TaskId(c as u8)),
            Ok(TaskState::Blocked)
        );
        // The alarm now tracks the one remaining sleeper.
        assert_eq!(crate::arch::armed_alarm(), Some(9_000));

        critical_section::with(|cs| {
            let k = kernel(cs);
            assert_eq!(k.tasks[a].wait_result, WaitResult::TimedOut);
            assert_eq!(k.tasks[a].wake_time, None);
        });
    }

    #[test]
    fn sleep_zero_is_a_yield() {
        let _guard = testing::fresh_kernel();
        let a = testing::spawn("a", Priority(2));
        let b = testing::spawn("b", Priority(2));
        testing::make_current(a);

        sleep_us(0);
        assert_eq!(testing::current(), b);
    }

    #[test]
    fn sleep_blocks_and_the_sweep_readies() {
        let _guard = testing::fresh_kernel();
        let a = testing::spawn("a", Priority(2));
        testing::make_current(a);

        crate::arch::set_time(1_000);
        sleep_us(500);
        // On the hosted port the switch is only recorded, so we can still
        // inspect the "sleeping" task.
        assert_eq!(crate::task::state(TaskId(a as u8)), Ok(TaskState::Blocked));
        assert_eq!(crate::arch::armed_alarm(), Some(1_500));

        crate::arch::set_time(1_500);
        handle_alarm();
        assert_ne!(
            crate::task::state(TaskId(a as u8)),
            Ok(TaskState::Blocked)
        );
        assert_eq!(crate::arch::armed_alarm(), None);
    }
}
