// Event loop library built on Linux file descriptor primitives.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::evloop::Error;

/// Cross-thread wake-up handle over an eventfd counter.
///
/// One per loop, created lazily by `EventLoop::waker` and alive until the
/// loop is dropped. Clones may be sent to other threads; [`Wakeup::signal`]
/// touches only the kernel counter and never any loop-owned state, which is
/// what makes it the one operation that is safe to call off-thread.
///
/// The loop does not watch the handle by itself. To react to wake-ups,
/// register it with `EventLoop::watch` and call [`Wakeup::drain`] from the
/// read callback; edge-triggered registrations must drain before returning.
#[derive(Clone)]
pub struct Wakeup {
    fd: Arc<OwnedFd>,
}

impl Wakeup {
    pub(crate) fn new() -> io::Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        #[cfg(feature = "log")]
        log::debug!(target: "evloop-wakeup", "Opened eventfd={raw}");
        Ok(Wakeup {
            fd: Arc::new(unsafe { OwnedFd::from_raw_fd(raw) }),
        })
    }

    /// Add `amount` to the counter, waking the loop if it is blocked. The
    /// amount must be at least 1. Fails with [`Error::WakeupSaturated`] when
    /// the counter is maxed out because the loop stopped draining.
    pub fn signal(&self, amount: u64) -> Result<(), Error> {
        if amount == 0 {
            return Err(Error::ZeroWakeup);
        }
        let buf = amount.to_ne_bytes();
        loop {
            let n = unsafe {
                libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 8)
            };
            if n == 8 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Err(Error::WakeupSaturated),
                _ => return Err(err.into()),
            }
        }
    }

    /// Take the accumulated count since the previous drain; `0` when nothing
    /// is pending. Never blocks.
    pub fn drain(&self) -> u64 {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8)
            };
            if n == 8 {
                return u64::from_ne_bytes(buf);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return 0,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    #[cfg(feature = "log")]
                    log::error!(target: "evloop-wakeup", "Draining eventfd failed: {err}");
                    return 0;
                }
            }
        }
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd { self.fd.as_raw_fd() }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::{EventLoop, WatchSpec};

    #[test]
    fn signal_accumulates_and_drain_resets() {
        let evl = EventLoop::new().unwrap();
        let waker = evl.waker().unwrap();

        assert!(matches!(waker.signal(0), Err(Error::ZeroWakeup)));
        assert_eq!(waker.drain(), 0, "fresh counter is empty");

        waker.signal(3).unwrap();
        waker.signal(4).unwrap();
        assert_eq!(waker.drain(), 7, "amounts coalesce");
        assert_eq!(waker.drain(), 0, "drain resets the counter");
    }

    #[test]
    fn waker_is_a_singleton_per_loop() {
        let evl = EventLoop::new().unwrap();
        let a = evl.waker().unwrap();
        let b = evl.waker().unwrap();
        assert_eq!(a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn wakes_blocked_loop_from_another_thread() {
        let evl = EventLoop::new().unwrap();
        let waker = evl.waker().unwrap();
        let woken = Rc::new(Cell::new(0u64));

        let inner = waker.clone();
        let w = woken.clone();
        evl.watch(
            &waker,
            WatchSpec::new().on_read(move |evl, _fd, _watcher| {
                w.set(inner.drain());
                evl.stop();
            }),
        )
        .unwrap();

        let (ready_send, ready_recv) = crossbeam_channel::bounded::<()>(1);
        let remote = waker.clone();
        let thread = thread::spawn(move || {
            ready_recv.recv().unwrap();
            thread::sleep(Duration::from_millis(20));
            remote.signal(2).unwrap();
        });

        ready_send.send(()).unwrap();
        evl.run().unwrap();
        thread.join().unwrap();
        assert!(woken.get() >= 2);
    }
}
