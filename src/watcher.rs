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

use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::evloop::{Error, EventLoop, LoopInner};
use crate::poller::Readiness;

/// User datum slot stored on watchers and subscriptions.
pub type SubData = Option<Box<dyn Any>>;

/// Shared, replaceable callback cell. The extra indirection lets a callback
/// replace itself from inside its own invocation: the old closure is kept
/// alive by the dispatching frame and dropped only after it returns.
pub(crate) type IoCb = Rc<RefCell<Box<dyn FnMut(&EventLoop, RawFd, &Watcher)>>>;

/// Identity of the open file behind a descriptor number, captured at
/// registration time and re-validated before every dispatch.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct FdIdent {
    dev: u64,
    ino: u64,
}

pub(crate) fn fd_ident(fd: RawFd) -> io::Result<FdIdent> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FdIdent {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
    })
}

/// Per-direction dispatch gate. Installing a callback enables its direction
/// unless the user has explicitly disabled it; clearing the callback resets
/// the gate so a later install enables again.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Gate {
    Auto,
    Enabled,
    Disabled,
}

/// Options accepted by [`EventLoop::watch`].
///
/// Installing a callback for a direction subscribes the watcher to it; error
/// readiness is reported by the kernel whether or not an error callback is
/// present. In edge-triggered mode the callbacks must drain the descriptor
/// until `EAGAIN`, the loop has no auto-drain.
#[derive(Default)]
pub struct WatchSpec {
    pub(crate) read: Option<Box<dyn FnMut(&EventLoop, RawFd, &Watcher)>>,
    pub(crate) write: Option<Box<dyn FnMut(&EventLoop, RawFd, &Watcher)>>,
    pub(crate) error: Option<Box<dyn FnMut(&EventLoop, RawFd, &Watcher)>>,
    pub(crate) data: SubData,
    pub(crate) edge_triggered: bool,
    pub(crate) one_shot: bool,
}

impl WatchSpec {
    pub fn new() -> Self { Self::default() }

    pub fn on_read(mut self, cb: impl FnMut(&EventLoop, RawFd, &Watcher) + 'static) -> Self {
        self.read = Some(Box::new(cb));
        self
    }

    pub fn on_write(mut self, cb: impl FnMut(&EventLoop, RawFd, &Watcher) + 'static) -> Self {
        self.write = Some(Box::new(cb));
        self
    }

    pub fn on_error(mut self, cb: impl FnMut(&EventLoop, RawFd, &Watcher) + 'static) -> Self {
        self.error = Some(Box::new(cb));
        self
    }

    pub fn data(mut self, data: impl Any) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub fn edge_triggered(mut self, edge: bool) -> Self {
        self.edge_triggered = edge;
        self
    }

    pub fn one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }
}

pub(crate) struct WatcherInner {
    pub(crate) fd: RawFd,
    pub(crate) ident: FdIdent,
    pub(crate) read_cb: RefCell<Option<IoCb>>,
    pub(crate) write_cb: RefCell<Option<IoCb>>,
    pub(crate) error_cb: RefCell<Option<IoCb>>,
    read_gate: Cell<Gate>,
    write_gate: Cell<Gate>,
    error_gate: Cell<Gate>,
    pub(crate) edge: Cell<bool>,
    pub(crate) one_shot: Cell<bool>,
    pub(crate) active: Cell<bool>,
    data: RefCell<SubData>,
    evloop: Weak<LoopInner>,
}

impl WatcherInner {
    pub(crate) fn from_spec(
        fd: RawFd,
        ident: FdIdent,
        spec: WatchSpec,
        evloop: Weak<LoopInner>,
    ) -> Rc<Self> {
        Rc::new(WatcherInner {
            fd,
            ident,
            read_cb: RefCell::new(spec.read.map(wrap)),
            write_cb: RefCell::new(spec.write.map(wrap)),
            error_cb: RefCell::new(spec.error.map(wrap)),
            read_gate: Cell::new(Gate::Auto),
            write_gate: Cell::new(Gate::Auto),
            error_gate: Cell::new(Gate::Auto),
            edge: Cell::new(spec.edge_triggered),
            one_shot: Cell::new(spec.one_shot),
            active: Cell::new(false),
            data: RefCell::new(spec.data),
            evloop,
        })
    }

    pub(crate) fn read_live(&self) -> bool {
        self.read_cb.borrow().is_some() && self.read_gate.get() != Gate::Disabled
    }

    pub(crate) fn write_live(&self) -> bool {
        self.write_cb.borrow().is_some() && self.write_gate.get() != Gate::Disabled
    }

    pub(crate) fn error_live(&self) -> bool {
        self.error_cb.borrow().is_some() && self.error_gate.get() != Gate::Disabled
    }

    /// Interest bits pushed down to the poll backend. Error readiness is not
    /// part of it: the kernel reports errors unconditionally and the error
    /// gate only filters dispatch.
    pub(crate) fn interest(&self) -> Readiness {
        let mut interest = Readiness::NONE;
        if self.read_live() {
            interest |= Readiness::READABLE;
        }
        if self.write_live() {
            interest |= Readiness::WRITABLE;
        }
        if self.edge.get() {
            interest |= Readiness::EDGE;
        }
        if self.one_shot.get() {
            interest |= Readiness::ONE_SHOT;
        }
        interest
    }
}

fn wrap(cb: Box<dyn FnMut(&EventLoop, RawFd, &Watcher)>) -> IoCb { Rc::new(RefCell::new(cb)) }

/// Handle to a registered descriptor.
///
/// All mutators reflect synchronously into the poll backend through the loop
/// that produced the handle. The watcher never owns the descriptor; closing
/// it remains the caller's responsibility, and [`Watcher::cancel`] only
/// de-registers.
#[derive(Clone)]
pub struct Watcher {
    inner: Rc<WatcherInner>,
}

impl Watcher {
    pub(crate) fn from_inner(inner: Rc<WatcherInner>) -> Self { Watcher { inner } }

    /// Descriptor number this watcher was registered for.
    pub fn fd(&self) -> RawFd { self.inner.fd }

    /// Whether the watcher is still present in its loop's table.
    pub fn is_active(&self) -> bool { self.inner.active.get() }

    /// Install or replace the read callback. Enables read dispatch unless
    /// the direction was explicitly disabled.
    pub fn on_read(&self, cb: impl FnMut(&EventLoop, RawFd, &Watcher) + 'static) -> Result<(), Error> {
        self.guard()?;
        *self.inner.read_cb.borrow_mut() = Some(wrap(Box::new(cb)));
        self.resync()
    }

    /// Remove the read callback, disabling read dispatch until a new one is
    /// installed.
    pub fn clear_read(&self) -> Result<(), Error> {
        self.guard()?;
        *self.inner.read_cb.borrow_mut() = None;
        self.inner.read_gate.set(Gate::Auto);
        self.resync()
    }

    pub fn enable_read(&self) -> Result<(), Error> {
        self.guard()?;
        self.inner.read_gate.set(Gate::Enabled);
        self.resync()
    }

    pub fn disable_read(&self) -> Result<(), Error> {
        self.guard()?;
        self.inner.read_gate.set(Gate::Disabled);
        self.resync()
    }

    /// Install or replace the write callback; same gating rules as
    /// [`Watcher::on_read`].
    pub fn on_write(&self, cb: impl FnMut(&EventLoop, RawFd, &Watcher) + 'static) -> Result<(), Error> {
        self.guard()?;
        *self.inner.write_cb.borrow_mut() = Some(wrap(Box::new(cb)));
        self.resync()
    }

    pub fn clear_write(&self) -> Result<(), Error> {
        self.guard()?;
        *self.inner.write_cb.borrow_mut() = None;
        self.inner.write_gate.set(Gate::Auto);
        self.resync()
    }

    pub fn enable_write(&self) -> Result<(), Error> {
        self.guard()?;
        self.inner.write_gate.set(Gate::Enabled);
        self.resync()
    }

    pub fn disable_write(&self) -> Result<(), Error> {
        self.guard()?;
        self.inner.write_gate.set(Gate::Disabled);
        self.resync()
    }

    /// Install or replace the error callback. Affects dispatch only; the
    /// backend reports error readiness regardless of interest.
    pub fn on_error(&self, cb: impl FnMut(&EventLoop, RawFd, &Watcher) + 'static) -> Result<(), Error> {
        self.guard()?;
        *self.inner.error_cb.borrow_mut() = Some(wrap(Box::new(cb)));
        Ok(())
    }

    pub fn clear_error(&self) -> Result<(), Error> {
        self.guard()?;
        *self.inner.error_cb.borrow_mut() = None;
        self.inner.error_gate.set(Gate::Auto);
        Ok(())
    }

    pub fn enable_error(&self) -> Result<(), Error> {
        self.guard()?;
        self.inner.error_gate.set(Gate::Enabled);
        Ok(())
    }

    pub fn disable_error(&self) -> Result<(), Error> {
        self.guard()?;
        self.inner.error_gate.set(Gate::Disabled);
        Ok(())
    }

    /// Switch between level- and edge-triggered reporting. In edge mode the
    /// callbacks must drain the descriptor to `EAGAIN`.
    pub fn set_edge_triggered(&self, edge: bool) -> Result<(), Error> {
        self.guard()?;
        self.inner.edge.set(edge);
        self.resync()
    }

    /// Arm or disarm one-shot mode. Issuing this from inside a callback
    /// performs a kernel-level re-arm even when the flag does not change.
    pub fn set_one_shot(&self, one_shot: bool) -> Result<(), Error> {
        self.guard()?;
        self.inner.one_shot.set(one_shot);
        self.resync()
    }

    pub fn set_data(&self, data: SubData) { *self.inner.data.borrow_mut() = data; }

    pub fn data_mut(&self) -> RefMut<'_, SubData> { self.inner.data.borrow_mut() }

    /// De-register from the loop. Idempotent; returns whether this handle
    /// actually removed the registration. A watcher replaced by a newer
    /// registration on the same descriptor reports `false`.
    pub fn cancel(&self) -> bool {
        let Some(evl) = self.inner.evloop.upgrade() else {
            return false;
        };
        evl.remove_watcher(&self.inner)
    }

    fn guard(&self) -> Result<(), Error> {
        if !self.inner.active.get() {
            return Err(Error::WatcherCancelled);
        }
        Ok(())
    }

    fn resync(&self) -> Result<(), Error> {
        let evl = self.inner.evloop.upgrade().ok_or(Error::LoopGone)?;
        evl.sync_interest(&self.inner)
    }
}
