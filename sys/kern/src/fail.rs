// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures such that they can be found by
//! tooling.
//!
//! The kernel only dies on unrecoverable states: failure to create the
//! idle task at init, or an invariant violation caught by `uassert!`.
//! When it does, this module makes the death legible to a debugger:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, cleared before the kernel starts
//!   and set on the way down. Any other value means the image never
//!   booted or memory is corrupt.
//!
//! - `KERNEL_EPITAPH` is a byte buffer holding as much of the failure
//!   message (UTF-8, NUL-padded) as fits.
//!
//! After recording, the kernel parks with interrupts masked in a
//! low-power wait. Panics are terminal; there is no unwinding and no
//! recovery.
//!
//! Hosted builds route [`die`] to an ordinary panic so tests can assert
//! on fatal paths.

#[cfg(target_os = "none")]
use core::fmt::{Display, Write};

use core::sync::atomic::{AtomicBool, Ordering};

/// Flag that gets set by all failure reporting functions, giving tools a
/// one-stop shop for kernel triage.
#[used]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

/// Records up to `EPITAPH_LEN` bytes of description of the event that
/// killed the kernel, padded with NULs.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    let already_failed = KERNEL_HAS_FAILED.swap(true, Ordering::SeqCst);
    if already_failed {
        // Failure while reporting a failure, i.e. a recursive panic.
        // Writing a second epitaph over the first would only destroy
        // evidence; stop here.
        crate::arch::halt();
    }

    // Safety: the swap above lets exactly one execution reach this point,
    // so the reference cannot be aliased.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records the kernel's cause of death and halts. Terminal.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let mut chisel = Chisel {
        epitaph: begin_epitaph(),
        cursor: 0,
    };
    write!(chisel, "{msg}").ok();

    crate::arch::halt()
}

/// Hosted stand-in for the real thing: fatal kernel errors become test
/// failures.
#[cfg(not(target_os = "none"))]
pub fn die(msg: impl core::fmt::Display) -> ! {
    KERNEL_HAS_FAILED.store(true, Ordering::SeqCst);
    panic!("kernel died: {msg}");
}

/// Formatter sink that carves the failure message into the epitaph
/// buffer. Once the buffer is full, further output is dropped on the
/// floor rather than reported as an error, so `write!` never aborts a
/// half-written message.
#[cfg(target_os = "none")]
struct Chisel {
    epitaph: &'static mut [u8; EPITAPH_LEN],
    cursor: usize,
}

#[cfg(target_os = "none")]
impl Write for Chisel {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &byte in s.as_bytes() {
            if self.cursor == EPITAPH_LEN {
                break;
            }
            self.epitaph[self.cursor] = byte;
            self.cursor += 1;
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
