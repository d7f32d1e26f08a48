// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queues.
//!
//! A queue is a ring of fixed-size messages over caller-provided storage.
//! Senders block when it's full, receivers when it's empty; each side
//! wakes one peer when it creates room or data. Everything serializes
//! through the ring under the kernel lock -- there is no direct hand-off
//! from a sender to a waiting receiver -- so messages are delivered
//! strictly in send order even when blocking and non-blocking callers mix.
//!
//! A woken task does not get its slot handed to it, only a strong hint:
//! it re-checks the ring, and in the unlikely event a polling peer stole
//! the space (or data) in between, it blocks again for whatever remains of
//! its original deadline.

use core::cell::RefCell;

use abi::{Error, INFINITE};

use crate::sched;
use crate::sem::Step;
use crate::startup::kernel;
use crate::task::WaitResult;
use crate::time::{self, Timestamp};
use crate::wait::WaitQueue;

struct Ring {
    buf: &'static mut [u8],
    msg_size: usize,
    capacity: usize,
    count: usize,
    head: usize,
    tail: usize,
}

impl Ring {
    fn slot(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.msg_size;
        &mut self.buf[start..start + self.msg_size]
    }
}

/// A bounded queue of fixed-size messages.
pub struct MessageQueue {
    ring: critical_section::Mutex<RefCell<Ring>>,
    send_waiters: WaitQueue,
    recv_waiters: WaitQueue,
}

impl MessageQueue {
    /// Creates a queue of `capacity` messages of `msg_size` bytes each,
    /// stored in `buffer`. The buffer must hold at least
    /// `msg_size * capacity` bytes; `Invalid` otherwise, or if either
    /// dimension is zero.
    pub fn new(
        buffer: &'static mut [u8],
        msg_size: usize,
        capacity: usize,
    ) -> Result<Self, Error> {
        match msg_size.checked_mul(capacity) {
            Some(n) if n > 0 && n <= buffer.len() => (),
            _ => return Err(Error::Invalid),
        }
        Ok(Self {
            ring: critical_section::Mutex::new(RefCell::new(Ring {
                buf: buffer,
                msg_size,
                capacity,
                count: 0,
                head: 0,
                tail: 0,
            })),
            send_waiters: WaitQueue::INIT,
            recv_waiters: WaitQueue::INIT,
        })
    }

    /// Computes the absolute deadline for a fresh blocking call. `None`
    /// means "no deadline" -- either a poll (which never blocks) or an
    /// infinite wait.
    fn deadline_for(timeout: u64) -> Option<Timestamp> {
        if timeout == 0 || timeout == INFINITE {
            None
        } else {
            Some(time::now().plus_us(timeout))
        }
    }

    /// Sends `msg` (exactly `msg_size` bytes, else `Invalid`), waiting up
    /// to `timeout` microseconds for space. A zero timeout polls; from ISR
    /// context the call degrades to a poll.
    pub fn send(&self, msg: &[u8], timeout: u64) -> Result<(), Error> {
        let timeout = if crate::arch::in_isr() { 0 } else { timeout };
        let can_block = timeout != 0;
        let deadline = Self::deadline_for(timeout);
        loop {
            match self.start_send(msg, can_block, deadline)? {
                Step::Done => return Ok(()),
                Step::Blocked => {
                    sched::reschedule();
                    self.finish_wait(&self.send_waiters)?;
                    // Granted: a receiver made room for us. Go take it.
                }
            }
        }
    }

    /// Receives one message into `msg` (exactly `msg_size` bytes, else
    /// `Invalid`), waiting up to `timeout` microseconds for data.
    pub fn recv(&self, msg: &mut [u8], timeout: u64) -> Result<(), Error> {
        let timeout = if crate::arch::in_isr() { 0 } else { timeout };
        let can_block = timeout != 0;
        let deadline = Self::deadline_for(timeout);
        loop {
            match self.start_recv(msg, can_block, deadline)? {
                Step::Done => return Ok(()),
                Step::Blocked => {
                    sched::reschedule();
                    self.finish_wait(&self.recv_waiters)?;
                }
            }
        }
    }

    /// The lock-held half of a send: enqueue (waking one receiver), or
    /// join the senders' wait queue.
    pub(crate) fn start_send(
        &self,
        msg: &[u8],
        can_block: bool,
        deadline: Option<Timestamp>,
    ) -> Result<Step, Error> {
        let outcome = critical_section::with(|cs| {
            let mut k = kernel(cs);
            let mut ring = self.ring.borrow_ref_mut(cs);
            if msg.len() != ring.msg_size {
                return Err(Error::Invalid);
            }

            if ring.count < ring.capacity {
                let tail = ring.tail;
                ring.slot(tail).copy_from_slice(msg);
                ring.tail = (ring.tail + 1) % ring.capacity;
                ring.count += 1;
                let woke =
                    self.recv_waiters.wake_head(cs, &mut k).is_some();
                return Ok((Step::Done, woke));
            }

            if !can_block {
                return Err(Error::Timeout);
            }
            if deadline.is_some_and(|d| d <= time::now()) {
                // We were woken in time once, but a poller squeezed in and
                // refilled the queue; the clock has since run out.
                return Err(Error::Timeout);
            }
            self.send_waiters.block_current(cs, &mut k, deadline);
            Ok((Step::Blocked, false))
        })?;

        if outcome.1 {
            sched::reschedule();
        }
        Ok(outcome.0)
    }

    /// The lock-held half of a receive: dequeue (waking one sender), or
    /// join the receivers' wait queue.
    pub(crate) fn start_recv(
        &self,
        msg: &mut [u8],
        can_block: bool,
        deadline: Option<Timestamp>,
    ) -> Result<Step, Error> {
        let outcome = critical_section::with(|cs| {
            let mut k = kernel(cs);
            let mut ring = self.ring.borrow_ref_mut(cs);
            if msg.len() != ring.msg_size {
                return Err(Error::Invalid);
            }

            if ring.count > 0 {
                let head = ring.head;
                msg.copy_from_slice(ring.slot(head));
                ring.head = (ring.head + 1) % ring.capacity;
                ring.count -= 1;
                let woke =
                    self.send_waiters.wake_head(cs, &mut k).is_some();
                return Ok((Step::Done, woke));
            }

            if !can_block {
                return Err(Error::Timeout);
            }
            if deadline.is_some_and(|d| d <= time::now()) {
                return Err(Error::Timeout);
            }
            self.recv_waiters.block_current(cs, &mut k, deadline);
            Ok((Step::Blocked, false))
        })?;

        if outcome.1 {
            sched::reschedule();
        }
        Ok(outcome.0)
    }

    /// The post-resume half shared by send and receive: translate the
    /// wait result, cleaning up after a timeout.
    pub(crate) fn finish_wait(&self, queue: &WaitQueue) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut k = kernel(cs);
            let cur = k.sched.current.expect("wait finished with no task");
            match k.tasks[cur].wait_result {
                WaitResult::Granted => Ok(()),
                WaitResult::TimedOut => {
                    queue.remove(cs, &mut k, cur);
                    Err(Error::Timeout)
                }
            }
        })
    }
}
