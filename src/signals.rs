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

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use crate::evloop::{Error, EventLoop};
use crate::watcher::{SubData, WatchSpec};

pub(crate) type SignalCb = Box<dyn FnMut(&EventLoop, i32, u32, &mut SubData)>;

/// Signal delivery over a lazily opened signalfd.
///
/// Registered signals are blocked in the thread mask so they queue on the
/// descriptor instead of interrupting; the accumulated mask only ever grows.
/// Each signal number maps to at most one subscription and re-registration
/// replaces the previous mapping for that number.
pub(crate) struct SignalState {
    weak: Weak<SignalState>,
    fd: RefCell<Option<OwnedFd>>,
    mask: RefCell<libc::sigset_t>,
    handlers: RefCell<BTreeMap<i32, Rc<SignalShared>>>,
}

struct SignalShared {
    sigs: Vec<i32>,
    cb: RefCell<SignalCb>,
    data: RefCell<SubData>,
    active: Cell<bool>,
}

impl SignalState {
    pub(crate) fn new() -> Rc<Self> {
        let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe { libc::sigemptyset(&mut mask) };
        Rc::new_cyclic(|weak| SignalState {
            weak: weak.clone(),
            fd: RefCell::new(None),
            mask: RefCell::new(mask),
            handlers: RefCell::new(empty!()),
        })
    }

    pub(crate) fn register(
        &self,
        evl: &EventLoop,
        sigs: &[i32],
        cb: SignalCb,
        data: SubData,
    ) -> Result<SignalSub, Error> {
        if sigs.is_empty() {
            return Err(Error::BadSignal(0));
        }
        let mut mask = *self.mask.borrow();
        for &sig in sigs {
            if unsafe { libc::sigaddset(&mut mask, sig) } != 0 {
                return Err(Error::BadSignal(sig));
            }
        }

        let flags = libc::SFD_NONBLOCK | libc::SFD_CLOEXEC;
        let created = self.fd.borrow().is_none();
        if created {
            let raw = unsafe { libc::signalfd(-1, &mask, flags) };
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let owned = unsafe { OwnedFd::from_raw_fd(raw) };

            let weak = self.weak.clone();
            let spec = WatchSpec::new().on_read(move |evl, _fd, _watcher| {
                if let Some(state) = weak.upgrade() {
                    state.drain(evl);
                }
            });
            if let Err(err) = evl.watch(&raw, spec) {
                drop(owned);
                return Err(err);
            }
            *self.fd.borrow_mut() = Some(owned);

            #[cfg(feature = "log")]
            log::debug!(target: "evloop-signal", "Opened signalfd={raw}");
        } else {
            let fd_slot = self.fd.borrow();
            let raw = fd_slot.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1);
            if unsafe { libc::signalfd(raw, &mask, flags) } < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret).into());
        }
        *self.mask.borrow_mut() = mask;

        let shared = Rc::new(SignalShared {
            sigs: sigs.to_vec(),
            cb: RefCell::new(cb),
            data: RefCell::new(data),
            active: Cell::new(true),
        });
        let mut handlers = self.handlers.borrow_mut();
        for &sig in sigs {
            #[cfg(feature = "log")]
            log::debug!(target: "evloop-signal", "Installing handler for signal {sig}");
            if let Some(old) = handlers.insert(sig, shared.clone()) {
                // The displaced subscription may still serve other signals;
                // it goes inactive only once no mapping points to it
                let orphaned = !old
                    .sigs
                    .iter()
                    .any(|s| handlers.get(s).map_or(false, |cur| Rc::ptr_eq(cur, &old)));
                if orphaned {
                    old.active.set(false);
                }
            }
        }

        Ok(SignalSub {
            shared,
            state: self.weak.clone(),
        })
    }

    /// Read callback of the signalfd watcher: consume every queued record,
    /// coalesce per signal number, then fire at most one callback per number
    /// in ascending order.
    fn drain(&self, evl: &EventLoop) {
        let Some(raw) = self.fd.borrow().as_ref().map(|fd| fd.as_raw_fd()) else {
            return;
        };

        let mut counts: BTreeMap<i32, u32> = empty!();
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let size = mem::size_of::<libc::signalfd_siginfo>();
            let n = unsafe {
                libc::read(raw, &mut info as *mut _ as *mut libc::c_void, size)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        #[cfg(feature = "log")]
                        log::error!(target: "evloop-signal", "Reading signalfd failed: {err}");
                        break;
                    }
                }
            }
            if n as usize != size {
                break;
            }
            *counts.entry(info.ssi_signo as i32).or_insert(0) += 1;
        }

        for (signum, count) in counts {
            // Fresh lookup per signal: a callback may cancel or replace
            // handlers for the numbers still pending in this batch
            let handler = self.handlers.borrow().get(&signum).cloned();
            let Some(sub) = handler else { continue };
            #[cfg(feature = "log")]
            log::trace!(target: "evloop-signal", "Dispatching signal {signum} (count={count})");
            (*sub.cb.borrow_mut())(evl, signum, count, &mut sub.data.borrow_mut());
        }
    }
}

/// Subscription handle returned by [`EventLoop::signal`].
pub struct SignalSub {
    shared: Rc<SignalShared>,
    state: Weak<SignalState>,
}

impl SignalSub {
    /// Remove the subscription's signal mappings. Idempotent; mappings taken
    /// over by a later registration are left untouched. The signals stay
    /// blocked in the thread mask.
    pub fn cancel(&self) -> bool {
        if !self.shared.active.replace(false) {
            return false;
        }
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut handlers = state.handlers.borrow_mut();
        for sig in &self.shared.sigs {
            if handlers.get(sig).map_or(false, |cur| Rc::ptr_eq(cur, &self.shared)) {
                handlers.remove(sig);
                #[cfg(feature = "log")]
                log::debug!(target: "evloop-signal", "Removed handler for signal {sig}");
            }
        }
        true
    }

    /// Whether any signal number still maps to this subscription.
    pub fn is_active(&self) -> bool { self.shared.active.get() }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_for(evl: &EventLoop, seconds: f64) {
        evl.after(seconds, |evl| evl.stop()).unwrap();
        evl.run().unwrap();
    }

    fn tag_of(data: &SubData) -> &'static str {
        data.as_ref().and_then(|d| d.downcast_ref::<&str>()).copied().unwrap_or("?")
    }

    #[test]
    fn replacement_and_cancel_sequence() {
        let evl = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        let first = evl
            .signal(
                &[libc::SIGUSR1],
                move |_evl, signum, count, data| {
                    assert_eq!(signum, libc::SIGUSR1);
                    assert!(count >= 1);
                    h.borrow_mut().push(("H1", tag_of(data)));
                },
                Some(Box::new("A")),
            )
            .unwrap();
        assert!(first.is_active());

        unsafe { libc::raise(libc::SIGUSR1) };
        run_for(&evl, 0.05);
        assert_eq!(*hits.borrow(), vec![("H1", "A")]);

        let h = hits.clone();
        let second = evl
            .signal(
                &[libc::SIGUSR1],
                move |_evl, _signum, _count, data| {
                    h.borrow_mut().push(("H2", tag_of(data)));
                },
                Some(Box::new("NEW")),
            )
            .unwrap();
        assert!(!first.is_active(), "replaced for its only signal");
        assert!(!first.cancel(), "nothing left to cancel");

        unsafe { libc::raise(libc::SIGUSR1) };
        run_for(&evl, 0.05);
        assert_eq!(*hits.borrow(), vec![("H1", "A"), ("H2", "NEW")]);

        assert!(second.cancel());
        assert!(!second.cancel(), "cancel is idempotent");

        unsafe { libc::raise(libc::SIGUSR1) };
        run_for(&evl, 0.3);
        assert_eq!(hits.borrow().len(), 2, "cancelled handler must stay silent");
    }

    #[test]
    fn one_subscription_many_signals_ascending_order() {
        let evl = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        let sub = evl
            .signal(
                &[libc::SIGUSR2, libc::SIGUSR1],
                move |_evl, signum, count, _data| {
                    assert_eq!(count, 1);
                    h.borrow_mut().push(signum);
                },
                None,
            )
            .unwrap();

        // Raised out of order; the drain delivers in ascending signum order
        unsafe { libc::raise(libc::SIGUSR2) };
        unsafe { libc::raise(libc::SIGUSR1) };
        run_for(&evl, 0.05);
        assert_eq!(*hits.borrow(), vec![libc::SIGUSR1, libc::SIGUSR2]);

        assert!(sub.cancel());
        assert!(!sub.is_active());
    }

    #[test]
    fn partial_replacement_keeps_subscription_active() {
        let evl = EventLoop::new().unwrap();
        let both = evl.signal(&[libc::SIGUSR1, libc::SIGUSR2], |_, _, _, _| {}, None).unwrap();
        let one = evl.signal(&[libc::SIGUSR2], |_, _, _, _| {}, None).unwrap();
        assert!(both.is_active(), "still mapped for the first signal");
        assert!(one.is_active());
        assert!(both.cancel());
        assert!(one.cancel());
    }

    #[test]
    fn invalid_signal_number_is_rejected() {
        let evl = EventLoop::new().unwrap();
        assert!(matches!(evl.signal(&[], |_, _, _, _| {}, None), Err(Error::BadSignal(0))));
        assert!(matches!(
            evl.signal(&[-1], |_, _, _, _| {}, None),
            Err(Error::BadSignal(-1))
        ));
    }
}
