// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted simulation port, for running the kernel's logic under `cargo
//! test` on a build machine.
//!
//! The clock is a number the test moves by hand; the alarm is recorded
//! rather than wired to an interrupt (tests call `time::handle_alarm`
//! themselves when they decide it fires); context switches are counted but
//! the stack swap never happens, so after a "switch" the test keeps
//! executing and can inspect both sides. ISR context is a flag a test can
//! set. Critical sections come from the `critical-section` crate's `std`
//! implementation.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

macro_rules! klog {
    ($s:expr) => { eprintln!(concat!("kern: ", $s)) };
    ($s:expr, $($tt:tt)*) => { eprintln!(concat!("kern: ", $s), $($tt)*) };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Saved machine state of a task. The hosted port never actually switches
/// stacks, so only the slot for the stack pointer exists, to keep the TCB
/// layout honest.
#[repr(C)]
#[derive(Debug)]
pub struct SavedState {
    sp: u32,
}

impl SavedState {
    pub const INIT: Self = Self { sp: 0 };

    pub(crate) fn set_stack_pointer(&mut self, sp: u32) {
        self.sp = sp;
    }

    pub(crate) fn stack_pointer(&self) -> u32 {
        self.sp
    }
}

static NOW_US: AtomicU64 = AtomicU64::new(0);
static ALARM_US: AtomicU64 = AtomicU64::new(0);
static ALARM_ARMED: AtomicBool = AtomicBool::new(false);
static IN_ISR: AtomicBool = AtomicBool::new(false);
static SWITCHES_PENDED: AtomicUsize = AtomicUsize::new(0);

/// Resets the simulated hardware. `sys_clock_hz` is checked for the same
/// constraint the real port has, then ignored -- the simulated clock
/// counts microseconds directly.
pub fn timer_init(sys_clock_hz: u32) {
    uassert!(sys_clock_hz >= 1_000_000);
    NOW_US.store(0, Ordering::Relaxed);
    ALARM_ARMED.store(false, Ordering::Relaxed);
    IN_ISR.store(false, Ordering::Relaxed);
    SWITCHES_PENDED.store(0, Ordering::Relaxed);
}

pub fn now_us() -> u64 {
    NOW_US.load(Ordering::Relaxed)
}

/// Moves the simulated clock. Time only goes forward.
pub fn set_time(us: u64) {
    uassert!(us >= now_us());
    NOW_US.store(us, Ordering::Relaxed);
}

pub fn set_alarm(abs_us: u64) {
    ALARM_US.store(abs_us, Ordering::Relaxed);
    ALARM_ARMED.store(true, Ordering::Relaxed);
}

pub fn cancel_alarm() {
    ALARM_ARMED.store(false, Ordering::Relaxed);
}

/// What the alarm is currently armed for, if anything. Test-side view of
/// the "hardware."
pub fn armed_alarm() -> Option<u64> {
    ALARM_ARMED
        .load(Ordering::Relaxed)
        .then(|| ALARM_US.load(Ordering::Relaxed))
}

pub fn in_isr() -> bool {
    IN_ISR.load(Ordering::Relaxed)
}

/// Makes the kernel believe it is (or isn't) running in interrupt
/// context.
pub fn set_in_isr(v: bool) {
    IN_ISR.store(v, Ordering::Relaxed);
}

/// "Primes" a stack. The hosted port can't run tasks, so no frame is
/// synthesized; the returned stack pointer is just the aligned top, which
/// keeps the bookkeeping plausible for inspection.
pub fn prime_stack(stack: &mut [u8], _entry: fn(usize), _arg: usize) -> u32 {
    let top = stack.as_ptr() as usize + stack.len();
    (top & !7) as u32
}

/// Records a deferred context-switch request. The scheduler's bookkeeping
/// (who is Running, who is Ready) is fully maintained by portable code, so
/// tests observe switches through that; this just counts the requests.
pub fn pend_switch(_from: &mut SavedState, _to: &mut SavedState) {
    SWITCHES_PENDED.fetch_add(1, Ordering::Relaxed);
}

/// Number of context switches requested since `timer_init`.
pub fn switches_pended() -> usize {
    SWITCHES_PENDED.load(Ordering::Relaxed)
}

/// # Safety
///
/// Never returns on real hardware; here it can't even start.
pub unsafe fn start_first_task(_save: &mut SavedState) -> ! {
    panic!("hosted port cannot enter tasks");
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn halt() -> ! {
    panic!("kernel halt");
}
