// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Talus kernel.
//!
//! Talus is a small preemptive, fixed-priority RTOS for microcontrollers.
//! Tasks run on caller-owned stacks, time comes from a 64-bit microsecond
//! clock with a single reprogrammable alarm, and the IPC primitives
//! (semaphores, priority-inheritance mutexes, bounded message queues) all
//! block through one shared wait-queue mechanism.
//!
//! Everything outside the `arch` module is portable; the ARMv7-M port is the
//! reference target, and a hosted port exists so the kernel's logic can be
//! exercised by ordinary `cargo test`.
//!
//! # Design principles
//!
//! There are some basic ideas that appear consistently in this code.
//!
//! 1. Static allocation. The task table is a fixed array, primitives are
//!    caller-constructed, and stacks belong to the application. The kernel
//!    never allocates.
//! 2. One lock. All kernel state is guarded by the global interrupt mask,
//!    expressed as a `critical-section` critical section. Critical sections
//!    are short, bounded, and never block.
//! 3. A strong preference for safe code. Task lists are linked by pool
//!    index, not by pointer, so all of the scheduler, timer, and IPC logic
//!    is safe Rust; `unsafe` is confined to the architecture ports.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms. List walks here are O(n) in the number of tasks, which is
//!    small and fixed.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod fail;
pub mod mqueue;
pub mod mutex;
pub mod sched;
pub mod sem;
pub mod startup;
pub mod task;
pub mod time;

mod wait;

#[cfg(test)]
mod testing;
