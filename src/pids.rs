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
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use crate::evloop::{Error, EventLoop};
use crate::watcher::{SubData, WatchSpec, Watcher};

pub(crate) type PidCb = Box<dyn FnMut(&EventLoop, i32, Option<i32>, &mut SubData)>;

/// Process-exit notifications over per-pid pidfds.
///
/// Each subscription opens a non-blocking pidfd and registers a watcher for
/// both read and error readiness (exit surfaces as readability; a foreign
/// process may surface as an error). Subscriptions are one-shot: after a
/// defined dispatch they tear themselves down. At most one subscription per
/// pid; re-registering replaces the previous one.
pub(crate) struct PidState {
    weak: Weak<PidState>,
    entries: RefCell<HashMap<i32, Rc<PidEntry>>>,
}

struct PidEntry {
    pid: i32,
    pidfd: RefCell<Option<OwnedFd>>,
    cb: RefCell<PidCb>,
    data: RefCell<SubData>,
    reap: bool,
    active: Cell<bool>,
    watcher: RefCell<Option<Watcher>>,
}

impl PidState {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| PidState {
            weak: weak.clone(),
            entries: RefCell::new(empty!()),
        })
    }

    pub(crate) fn register(
        &self,
        evl: &EventLoop,
        pid: i32,
        cb: PidCb,
        data: SubData,
        reap: bool,
    ) -> Result<PidSub, Error> {
        if pid <= 0 {
            return Err(Error::BadPid(pid));
        }

        let raw = unsafe {
            libc::syscall(
                libc::SYS_pidfd_open,
                pid as libc::c_long,
                libc::PIDFD_NONBLOCK as libc::c_long,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let pidfd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };
        let raw = pidfd.as_raw_fd();

        // Replacement semantics: the previous subscription for this pid is
        // torn down before the new one registers
        let old = self.entries.borrow_mut().remove(&pid);
        if let Some(old) = old {
            self.teardown(&old);
        }

        let entry = Rc::new(PidEntry {
            pid,
            pidfd: RefCell::new(Some(pidfd)),
            cb: RefCell::new(cb),
            data: RefCell::new(data),
            reap,
            active: Cell::new(true),
            watcher: RefCell::new(None),
        });

        let spec = WatchSpec::new().on_read(self.hook(&entry)).on_error(self.hook(&entry));
        let watcher = evl.watch(&raw, spec)?;
        *entry.watcher.borrow_mut() = Some(watcher);
        self.entries.borrow_mut().insert(pid, entry.clone());

        #[cfg(feature = "log")]
        log::debug!(target: "evloop-pid", "Watching pid {pid} via pidfd={raw} (reap={reap})");

        Ok(PidSub {
            entry,
            state: self.weak.clone(),
        })
    }

    fn hook(&self, entry: &Rc<PidEntry>) -> impl FnMut(&EventLoop, RawFd, &Watcher) + 'static {
        let state = self.weak.clone();
        let entry = Rc::downgrade(entry);
        move |evl, _fd, _watcher| {
            let (Some(state), Some(entry)) = (state.upgrade(), entry.upgrade()) else {
                return;
            };
            state.handle_ready(evl, &entry);
        }
    }

    fn handle_ready(&self, evl: &EventLoop, entry: &Rc<PidEntry>) {
        if !entry.active.get() {
            return;
        }

        let status = if entry.reap {
            let Some(raw) = entry.pidfd.borrow().as_ref().map(|fd| fd.as_raw_fd()) else {
                return;
            };
            let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
            let ret = unsafe {
                libc::waitid(
                    libc::P_PIDFD,
                    raw as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOHANG,
                )
            };
            if ret != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    panic!(
                        "pid {} is not a child of this process (or was already reaped) and can \
                         not be waited for",
                        entry.pid
                    );
                }
                #[cfg(feature = "log")]
                log::error!(target: "evloop-pid", "waitid for pid {} failed: {err}", entry.pid);
                return;
            }
            if unsafe { info.si_pid() } == 0 {
                // Readable but no status yet; keep the subscription armed
                return;
            }
            Some(wait_status(&info))
        } else {
            None
        };

        #[cfg(feature = "log")]
        log::debug!(target: "evloop-pid", "Process {} exited (status={status:?})", entry.pid);

        (*entry.cb.borrow_mut())(evl, entry.pid, status, &mut entry.data.borrow_mut());
        // One-shot: a defined dispatch retires the subscription
        self.teardown(entry);
    }

    /// Idempotent teardown shared by dispatch, cancellation and replacement.
    /// Returns whether the entry was still active.
    fn teardown(&self, entry: &Rc<PidEntry>) -> bool {
        let was_active = entry.active.replace(false);
        if let Some(watcher) = entry.watcher.borrow_mut().take() {
            watcher.cancel();
        }
        entry.pidfd.borrow_mut().take();
        let mut entries = self.entries.borrow_mut();
        if entries.get(&entry.pid).map_or(false, |cur| Rc::ptr_eq(cur, entry)) {
            entries.remove(&entry.pid);
        }
        was_active
    }
}

/// Reconstruct a wait(2)-compatible status word so the standard `WIFEXITED`
/// and `WIFSIGNALED` predicates hold on the delivered value.
fn wait_status(info: &libc::siginfo_t) -> i32 {
    let status = unsafe { info.si_status() };
    match info.si_code {
        libc::CLD_EXITED => (status & 0xff) << 8,
        libc::CLD_DUMPED => (status & 0x7f) | 0x80,
        _ => status & 0x7f,
    }
}

/// Subscription handle returned by [`EventLoop::pid`].
pub struct PidSub {
    entry: Rc<PidEntry>,
    state: Weak<PidState>,
}

impl PidSub {
    /// Remove the watcher and close the pidfd. Idempotent; returns whether
    /// the subscription was still active.
    pub fn cancel(&self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        state.teardown(&self.entry)
    }

    pub fn is_active(&self) -> bool { self.entry.active.get() }
}
