// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M (the Cortex-M3 class reference
//! target).
//!
//! # Timekeeping
//!
//! We use the system tick timer as the kernel's time source. It's a poor
//! fit on paper -- a small down-counter that only knows how to reload --
//! but it exists on every M-profile part, which beats SoC-specific timer
//! blocks. It reloads every millisecond; the `TICKS` globals accumulate
//! the elapsed microseconds, and `now_us` adds the fraction read back out
//! of the down-counter. The kernel's one-shot alarm is a stored deadline
//! that the tick handler checks, so an alarm can fire up to one tick late.
//! That slack is within the kernel's documented best-effort bound for
//! timeouts.
//!
//! # The deferred context switch
//!
//! Kernel code never swaps stacks itself. When the scheduler decides a
//! different task should run, it calls [`pend_switch`], which records
//! where the outgoing stack pointer must be saved and where the incoming
//! one is, then pends the PendSV exception. PendSV is configured at the
//! lowest exception priority, so the actual register save/restore runs
//! only after interrupts are unmasked and every pending ISR has been
//! delivered. An ISR can therefore wake tasks and request a switch without
//! re-entering kernel code that was interrupted mid-update, and nested
//! preemption is never dropped. This is the standard Cortex-M arrangement;
//! most books on these parts describe it.
//!
//! If several switch requests pile up before PendSV gets to run, the
//! *first* outgoing slot sticks -- it names the task whose registers are
//! actually on the CPU -- while the incoming slot tracks the latest
//! decision. PendSV then moves the registers once, directly from the real
//! outgoing task to the final incoming one.
//!
//! # Exception priority discipline
//!
//! `start_first_task` sets SVCall, SysTick, and PendSV to the lowest
//! priority. Kernel entry points don't preempt each other; device ISRs
//! that call kernel services run inside the PRIMASK critical section those
//! services take. The globals in this file are only touched under one of
//! those umbrellas, which is what makes the split 64-bit counters sound.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use zerocopy::{Immutable, IntoBytes};

#[cfg(not(any(feature = "klog-itm", feature = "klog-semihosting")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Saved machine state of a task while it is not running.
///
/// Only the stack pointer lives here; the rest of the register file is on
/// the task's own stack, in the layout [`InitialFrame`] describes. The
/// context-switch handlers address this field through raw pointers
/// recorded by [`pend_switch`], which is why it must sit at a known offset
/// -- the start -- of the TCB.
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

/// Microseconds added to the kernel clock per SysTick reload.
const TICK_PERIOD_US: u32 = 1_000;

/// Kernel clock in microseconds, split across two words because ARMv7-M
/// has no 64-bit atomics. `TICKS[0]` is the least significant half. Only
/// read or written under the exception-priority discipline described in
/// the module docs.
static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

static CYCLES_PER_US: AtomicU32 = AtomicU32::new(0);
static SYST_RELOAD: AtomicU32 = AtomicU32::new(0);

/// Alarm deadline in microseconds, split like `TICKS`.
static ALARM_US: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};
static ALARM_ARMED: AtomicBool = AtomicBool::new(false);

/// Address of the outgoing task's saved-SP slot, or 0 when no switch is
/// pending. Read and cleared by the PendSV handler.
#[no_mangle]
static SWITCH_FROM_SP: AtomicU32 = AtomicU32::new(0);

/// Address of the incoming task's saved-SP slot.
#[no_mangle]
static SWITCH_TO_SP: AtomicU32 = AtomicU32::new(0);

/// Configures SysTick as the kernel clock. The system clock must be a
/// whole number of MHz so the microsecond math stays exact, and slow
/// enough that a millisecond of it fits the 24-bit reload field.
pub fn timer_init(sys_clock_hz: u32) {
    uassert!(sys_clock_hz >= 1_000_000);
    uassert!(sys_clock_hz % 1_000_000 == 0);
    let cycles_per_us = sys_clock_hz / 1_000_000;
    let reload = cycles_per_us * TICK_PERIOD_US - 1;
    uassert!(reload <= 0x00FF_FFFF);

    CYCLES_PER_US.store(cycles_per_us, Ordering::Relaxed);
    SYST_RELOAD.store(reload, Ordering::Relaxed);
    TICKS[0].store(0, Ordering::Relaxed);
    TICKS[1].store(0, Ordering::Relaxed);
    ALARM_ARMED.store(false, Ordering::Relaxed);
    SWITCH_FROM_SP.store(0, Ordering::Relaxed);

    // Safety: this is safe in practice but unsafe in the register API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(reload);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt, clocked from the processor.
        syst.csr.modify(|v| v | 0b111);
    }
}

fn ticks() -> u64 {
    u64::from(TICKS[0].load(Ordering::Relaxed))
        | u64::from(TICKS[1].load(Ordering::Relaxed)) << 32
}

/// Reads the kernel clock: tick accumulator plus the fraction sitting in
/// the down-counter.
pub fn now_us() -> u64 {
    critical_section::with(|_| {
        // Safety: reads of architectural read-only/side-effect-free
        // registers.
        let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
        let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };

        let mut base = ticks();
        let mut cvr = syst.cvr.read();

        // If the counter wrapped while interrupts were masked, the tick
        // handler hasn't run yet and `base` is one period stale. The
        // pending SysTick exception tells us; fold the period in and
        // re-read the (now small) counter so the two agree.
        const ICSR_PENDSTSET: u32 = 1 << 26;
        if scb.icsr.read() & ICSR_PENDSTSET != 0 {
            cvr = syst.cvr.read();
            base += u64::from(TICK_PERIOD_US);
        }

        let reload = SYST_RELOAD.load(Ordering::Relaxed);
        let cycles_per_us = CYCLES_PER_US.load(Ordering::Relaxed);
        base + u64::from((reload - cvr) / cycles_per_us)
    })
}

/// Arms the one-shot alarm for an absolute time. Must be called inside
/// the kernel critical section (every caller is the timer module, which
/// is). A deadline already in the past fires at the next tick.
pub fn set_alarm(abs_us: u64) {
    ALARM_US[0].store(abs_us as u32, Ordering::Relaxed);
    ALARM_US[1].store((abs_us >> 32) as u32, Ordering::Relaxed);
    ALARM_ARMED.store(true, Ordering::Relaxed);
}

/// Disarms the alarm. Same locking requirement as [`set_alarm`].
pub fn cancel_alarm() {
    ALARM_ARMED.store(false, Ordering::Relaxed);
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    // Advance the kernel's notion of time. Laboriously, since this is two
    // words pretending to be one.
    let t0 = TICKS[0].load(Ordering::Relaxed);
    let t1 = TICKS[1].load(Ordering::Relaxed);
    let (t0, t1) = match t0.checked_add(TICK_PERIOD_US) {
        Some(t0p) => {
            TICKS[0].store(t0p, Ordering::Relaxed);
            (t0p, t1)
        }
        None => {
            let t0p = t0.wrapping_add(TICK_PERIOD_US);
            // Normal checked addition for the high word: an overflow here
            // would mean half a million years of uptime, i.e. corruption
            // we'd like to hear about.
            TICKS[0].store(t0p, Ordering::Relaxed);
            TICKS[1].store(t1 + 1, Ordering::Relaxed);
            (t0p, t1 + 1)
        }
    };

    if ALARM_ARMED.load(Ordering::Relaxed) {
        let deadline = u64::from(ALARM_US[0].load(Ordering::Relaxed))
            | u64::from(ALARM_US[1].load(Ordering::Relaxed)) << 32;
        let now = u64::from(t0) | u64::from(t1) << 32;
        if now >= deadline {
            ALARM_ARMED.store(false, Ordering::Relaxed);
            // Wakes every expired sleeper and, if that changes the
            // scheduling picture, pends PendSV -- which runs once we
            // return.
            crate::time::handle_alarm();
        }
    }
}

/// True when executing in any exception handler.
pub fn in_isr() -> bool {
    // Safety: reading ICSR has no side effects.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    scb.icsr.read() & 0x1FF != 0
}

/// Requests a deferred context switch from `from` to `to`.
///
/// Must be called with interrupts masked (the scheduler always holds the
/// kernel critical section here). The switch itself happens in PendSV
/// after the mask is released.
pub fn pend_switch(from: &mut SavedState, to: &mut SavedState) {
    let from_addr = core::ptr::addr_of_mut!(from.sp) as u32;
    let to_addr = core::ptr::addr_of_mut!(to.sp) as u32;

    // Keep the first outgoing slot if one is already pending: it names
    // the task whose registers are actually on the CPU. The incoming slot
    // always tracks the latest decision.
    let _ = SWITCH_FROM_SP.compare_exchange(
        0,
        from_addr,
        Ordering::Relaxed,
        Ordering::Relaxed,
    );
    SWITCH_TO_SP.store(to_addr, Ordering::Relaxed);

    cortex_m::peripheral::SCB::set_pendsv();
}

/// Initial xPSR: just the Thumb mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN for "return to Thread mode, Process stack."
const EXC_RETURN_CONST: u32 = 0xFFFFFFFD;

/// The register image a task starts from, laid out exactly as the switch
/// path expects to find it on the stack: the callee-saved registers that
/// PendSV pops, then the hardware exception frame the processor pops on
/// exception return.
#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct InitialFrame {
    // Software-saved part (`ldmia {r4-r11}` in the handlers).
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    // Hardware-stacked part.
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Where control lands if a task's entry function returns: a quiet,
/// permanent nap. Tasks are deleted, not returned from.
extern "C" fn task_exit() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Primes a fresh stack so the first switch into the task behaves like a
/// return from preemption that happened just before `entry(arg)` ran.
/// Returns the initial stack pointer.
pub fn prime_stack(stack: &mut [u8], entry: fn(usize), arg: usize) -> u32 {
    let base = stack.as_ptr() as usize;
    // AAPCS wants 8-byte stack alignment at the exception boundary.
    let top = (base + stack.len()) & !7;
    let frame_size = core::mem::size_of::<InitialFrame>();
    uassert!(top >= base + frame_size);
    let sp = top - frame_size;

    let frame = InitialFrame {
        r4: 0,
        r5: 0,
        r6: 0,
        r7: 0,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        r0: arg as u32,
        r1: 0,
        r2: 0,
        r3: 0,
        r12: 0,
        // Bit 0 set on both code addresses: these are Thumb entry points.
        lr: task_exit as usize as u32 | 1,
        pc: entry as usize as u32 | 1,
        xpsr: INITIAL_PSR,
    };
    stack[sp - base..sp - base + frame_size]
        .copy_from_slice(frame.as_bytes());
    sp as u32
}

/// Enters the first task. Configures exception priorities, records the
/// task's saved-SP slot for the SVCall handler, and traps into it.
///
/// # Safety
///
/// `save` must point at the TCB of a task the scheduler has marked
/// running, with a stack primed by [`prime_stack`]. Call once.
pub unsafe fn start_first_task(save: &mut SavedState) -> ! {
    // Keep the kernel non-preemptive: SVCall, SysTick, and PendSV all go
    // to the lowest exception priority, so they can't interrupt each
    // other -- only tail-chain.
    //
    // Safety: purely lowering priorities from their defaults; can't cause
    // surprise preemption. The register API is unsafe regardless.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SVCall.
        scb.shpr[7].write(0xFF);
        // PendSV and SysTick.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);
    }

    SWITCH_TO_SP
        .store(core::ptr::addr_of_mut!(save.sp) as u32, Ordering::Relaxed);

    // Trap into the kernel; the SVCall handler below finishes the job by
    // adopting the task's stack and returning into Thread mode on PSP.
    unsafe {
        core::arch::asm!("svc #0", options(noreturn));
    }
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Terminal halt: interrupts off, low-power wait, forever.
pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

cfg_if::cfg_if! {
    if #[cfg(armv7m)] {
        // The SVCall handler is used exactly once, to start the first
        // task: it adopts the stack that `start_first_task` advertised in
        // SWITCH_TO_SP and "returns" into the task. (Tasks call kernel
        // services as plain functions, so there are no other SVCs.)
        core::arch::global_asm! {"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                movw r0, #:lower16:SWITCH_TO_SP
                movt r0, #:upper16:SWITCH_TO_SP
                ldr r0, [r0]
                ldr r1, [r0]            @ initial stack pointer
                ldmia r1!, {{r4-r11}}   @ software-saved half of the frame
                msr PSP, r1             @ hardware pops the rest
                mov lr, {exc_return}
                bx lr
            ",
            exc_return = const EXC_RETURN_CONST,
        }

        // PendSV performs the deferred switch. Interrupts are masked for
        // its short body: an ISR arriving mid-switch could otherwise
        // re-aim SWITCH_TO_SP after we've already chosen a stack, and the
        // follow-up PendSV would then save the wrong register file.
        core::arch::global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                cpsid i
                movw r0, #:lower16:SWITCH_FROM_SP
                movt r0, #:upper16:SWITCH_FROM_SP
                ldr r1, [r0]
                cbz r1, 1f              @ no switch pending after all
                @ Park the outgoing task's callee-saved registers on its
                @ stack and publish the resulting stack pointer.
                mrs r2, PSP
                stmdb r2!, {{r4-r11}}
                str r2, [r1]
                movs r2, #0
                str r2, [r0]
                @ Adopt the incoming task.
                movw r0, #:lower16:SWITCH_TO_SP
                movt r0, #:upper16:SWITCH_TO_SP
                ldr r0, [r0]
                ldr r2, [r0]
                ldmia r2!, {{r4-r11}}
                msr PSP, r2
            1:  cpsie i
                bx lr
            ",
        }
    } else {
        compile_error!("missing context switch support for this M profile");
    }
}
