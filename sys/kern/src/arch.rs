// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each port module must define the same set of names:
//! the `SavedState` stored at the front of every TCB, the interrupt-mask
//! implementation for the `critical-section` crate, the microsecond clock
//! (`timer_init`/`now_us`), the one-shot alarm (`set_alarm`/
//! `cancel_alarm`), stack priming, the deferred context switch
//! (`pend_switch`), `start_first_task`, `in_isr`, `wait_for_interrupt`,
//! `halt`, and the `klog!`/`uassert!` macros.
//!
//! Anything that is not an ARM microcontroller gets the hosted port, which
//! simulates the time and switching hardware well enough to run the
//! kernel's logic under `cargo test` on a build machine.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod host;
        pub use host::*;
    }
}
