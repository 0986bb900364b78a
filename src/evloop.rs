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
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::pids::{PidState, PidSub};
use crate::poller::{Epoll, Poll, Readiness};
use crate::sched::Scheduler;
use crate::signals::{SignalState, SignalSub};
use crate::timerfd::{KernelTimer, TimerFd};
use crate::watcher::{fd_ident, IoCb, SubData, WatchSpec, Watcher, WatcherInner};
use crate::wakeup::Wakeup;

/// Errors generated by the event loop and its adaptors.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// descriptor {0} can not be watched
    BadDescriptor(RawFd),

    /// signal number {0} is not valid on this system
    BadSignal(i32),

    /// process id {0} is not a positive integer
    BadPid(i32),

    /// wake-up amount must be at least 1
    ZeroWakeup,

    /// wake-up counter is saturated; the owning loop is not draining it
    WakeupSaturated,

    /// watcher is cancelled and no longer drives a descriptor
    WatcherCancelled,

    /// the event loop serving this handle is gone
    LoopGone,

    /// system call failed: {0}
    #[from]
    Kernel(io::Error),
}

/// Single-threaded event loop over Linux descriptor primitives.
///
/// Owns a watcher table keyed by raw descriptor, a deadline scheduler backed
/// by one kernel timer, and lazily created signal, wake-up and process-exit
/// adaptors. All callbacks run on the thread calling [`EventLoop::run`] or
/// [`EventLoop::run_once`]; the loop is not `Send` and loops on different
/// threads share nothing.
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

pub(crate) struct LoopInner {
    poller: RefCell<Box<dyn Poll>>,
    clock: Rc<dyn Clock>,
    timer: RefCell<Box<dyn KernelTimer>>,
    sched: RefCell<Scheduler>,
    watchers: RefCell<HashMap<RawFd, Rc<WatcherInner>>>,
    running: Cell<bool>,
    stop_pending: Cell<bool>,
    signals: RefCell<Option<Rc<SignalState>>>,
    wakeup: RefCell<Option<Wakeup>>,
    pids: RefCell<Option<Rc<PidState>>>,
}

impl EventLoop {
    /// Create a loop polling through [`Epoll`].
    pub fn new() -> Result<Self, Error> { Self::with_poller(Box::new(Epoll::new()?)) }

    /// Create a loop over a custom readiness backend.
    pub fn with_poller(poller: Box<dyn Poll>) -> Result<Self, Error> {
        let clock = Rc::new(MonotonicClock::new());
        let timer = TimerFd::new()?;
        let timer_fd = timer.as_raw_fd();

        let evl = EventLoop {
            inner: Rc::new(LoopInner {
                poller: RefCell::new(poller),
                clock: clock.clone(),
                timer: RefCell::new(Box::new(timer)),
                sched: RefCell::new(Scheduler::new(clock)),
                watchers: RefCell::new(empty!()),
                running: Cell::new(false),
                stop_pending: Cell::new(false),
                signals: RefCell::new(None),
                wakeup: RefCell::new(None),
                pids: RefCell::new(None),
            }),
        };

        // The kernel timer is dispatched like any other readable descriptor
        evl.watch(
            &timer_fd,
            WatchSpec::new().on_read(|evl, _fd, _watcher| evl.handle_timer_wake()),
        )?;

        #[cfg(feature = "log")]
        log::debug!(target: "evloop", "Event loop created (timerfd={timer_fd})");

        Ok(evl)
    }

    /// Cached monotonic now, in nanoseconds.
    pub fn now_ns(&self) -> i64 { self.inner.clock.now_ns() }

    /// Register a descriptor, replacing any previous watcher for the same
    /// descriptor number. Replacement is atomic: once this returns, the old
    /// watcher is cancelled and its callbacks are never invoked again, while
    /// on failure the old watcher stays registered untouched.
    pub fn watch(&self, handle: &impl AsRawFd, spec: WatchSpec) -> Result<Watcher, Error> {
        let fd = handle.as_raw_fd();
        if fd < 0 {
            return Err(Error::BadDescriptor(fd));
        }
        let ident = fd_ident(fd)?;

        let inner = WatcherInner::from_spec(fd, ident, spec, Rc::downgrade(&self.inner));
        let old = self.inner.watchers.borrow().get(&fd).cloned();

        {
            let mut poller = self.inner.poller.borrow_mut();
            match &old {
                // Take over the existing kernel registration in place; a
                // failure must leave the previous watcher fully intact
                Some(old) => {
                    if !poller.modify(fd, inner.interest())? {
                        poller.unwatch(fd);
                        if let Err(err) = poller.watch(fd, inner.interest()) {
                            // Put the previous registration back; the table
                            // still owns the old watcher
                            poller.watch(fd, old.interest()).ok();
                            return Err(err.into());
                        }
                    }
                }
                None => poller.watch(fd, inner.interest())?,
            }
        }

        if let Some(old) = old {
            #[cfg(feature = "log")]
            log::debug!(target: "evloop", "Replacing existing watcher for fd={fd}");
            self.inner.watchers.borrow_mut().remove(&fd);
            old.active.set(false);
        }

        inner.active.set(true);
        self.inner.watchers.borrow_mut().insert(fd, inner.clone());

        #[cfg(feature = "log")]
        log::debug!(target: "evloop", "Watching fd={fd} with interest {}", inner.interest());

        Ok(Watcher::from_inner(inner))
    }

    /// Remove the watcher for a descriptor. Idempotent; unknown descriptors
    /// report `false` with no side effects.
    pub fn unwatch(&self, handle: &impl AsRawFd) -> bool {
        let fd = handle.as_raw_fd();
        let Some(watcher) = self.inner.watchers.borrow().get(&fd).cloned() else {
            return false;
        };
        self.inner.remove_watcher(&watcher)
    }

    /// Schedule a callback `seconds` from now; negative values clamp to
    /// zero, which fires on the next iteration. Returns a timer id usable
    /// with [`EventLoop::cancel`].
    pub fn after(&self, seconds: f64, cb: impl FnOnce(&EventLoop) + 'static) -> Result<u64, Error> {
        let id = self.inner.sched.borrow_mut().after_ns(secs_to_ns_delta(seconds), Box::new(cb));
        self.rearm_kernel_timer()?;
        #[cfg(feature = "log")]
        log::trace!(target: "evloop", "Scheduled timer {id} in {seconds}s");
        Ok(id)
    }

    /// Schedule a callback at an absolute monotonic deadline in seconds.
    pub fn at(&self, deadline_seconds: f64, cb: impl FnOnce(&EventLoop) + 'static) -> Result<u64, Error> {
        let deadline = (deadline_seconds * 1e9) as i64;
        let id = self.inner.sched.borrow_mut().at_ns(deadline, Box::new(cb));
        self.rearm_kernel_timer()?;
        #[cfg(feature = "log")]
        log::trace!(target: "evloop", "Scheduled timer {id} at {deadline_seconds}s");
        Ok(id)
    }

    /// Cancel a pending timer; returns whether the id was still live.
    pub fn cancel(&self, timer_id: u64) -> bool {
        let hit = self.inner.sched.borrow_mut().cancel(timer_id);
        if hit {
            if let Err(err) = self.rearm_kernel_timer() {
                #[cfg(feature = "log")]
                log::error!(target: "evloop", "Kernel timer re-arm failed after cancel: {err}");
            }
        }
        hit
    }

    /// Subscribe a callback to one or more signals. Signals are delivered
    /// through a signalfd owned by the loop; each signal number holds at
    /// most one handler and re-registering replaces the previous one. The
    /// blocked signal mask of the process grows with every registration and
    /// is never shrunk back.
    pub fn signal(
        &self,
        sigs: &[i32],
        cb: impl FnMut(&EventLoop, i32, u32, &mut SubData) + 'static,
        data: SubData,
    ) -> Result<SignalSub, Error> {
        let state = self.inner.signals.borrow_mut().get_or_insert_with(SignalState::new).clone();
        state.register(self, sigs, Box::new(cb), data)
    }

    /// The loop's wake-up handle, created on first request. Clones may be
    /// moved to other threads; [`Wakeup::signal`] is the only loop entry
    /// point that is safe off-thread. The loop installs no watcher for it.
    pub fn waker(&self) -> Result<Wakeup, Error> {
        let mut slot = self.inner.wakeup.borrow_mut();
        if let Some(waker) = slot.as_ref() {
            return Ok(waker.clone());
        }
        let waker = Wakeup::new()?;
        *slot = Some(waker.clone());
        Ok(waker)
    }

    /// Subscribe to the exit of process `pid` through a pidfd. One-shot: the
    /// subscription cancels itself after delivering a defined status. With
    /// `reap` the exit status is collected with a non-blocking wait, which
    /// requires `pid` to be a child of this process.
    pub fn pid(
        &self,
        pid: i32,
        cb: impl FnMut(&EventLoop, i32, Option<i32>, &mut SubData) + 'static,
        data: SubData,
        reap: bool,
    ) -> Result<PidSub, Error> {
        let state = self.inner.pids.borrow_mut().get_or_insert_with(PidState::new).clone();
        state.register(self, pid, Box::new(cb), data, reap)
    }

    /// Run until [`EventLoop::stop`] is called.
    pub fn run(&self) -> Result<(), Error> {
        self.inner.running.set(true);
        #[cfg(feature = "log")]
        log::debug!(target: "evloop", "Entering event loop");
        while self.inner.running.get() {
            self.iterate(None)?;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "evloop", "Event loop stopped");
        Ok(())
    }

    /// Run one iteration: dispatch due timers, then block for readiness at
    /// most `timeout` (`None` blocks until an event, zero polls) and
    /// dispatch whatever became ready.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<(), Error> { self.iterate(timeout) }

    /// Request the loop to stop. Dispatches already pending in the current
    /// iteration complete, but the loop will not enter the next blocking
    /// wait.
    pub fn stop(&self) {
        self.inner.running.set(false);
        self.inner.stop_pending.set(true);
    }

    fn iterate(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.inner.stop_pending.set(false);
        self.inner.clock.tick();
        self.dispatch_due_timers();
        self.rearm_kernel_timer()?;
        if self.inner.stop_pending.get() {
            return Ok(());
        }
        self.inner.poller.borrow_mut().wait(timeout)?;
        self.dispatch_ready();
        Ok(())
    }

    /// Read callback of the internal kernel-timer watcher.
    fn handle_timer_wake(&self) {
        if let Err(err) = self.inner.timer.borrow_mut().read_ticks() {
            #[cfg(feature = "log")]
            log::error!(target: "evloop", "Kernel timer read failed: {err}");
        }
        self.inner.clock.tick();
        self.dispatch_due_timers();
        if let Err(err) = self.rearm_kernel_timer() {
            #[cfg(feature = "log")]
            log::error!(target: "evloop", "Kernel timer re-arm failed: {err}");
        }
    }

    fn dispatch_due_timers(&self) {
        // The batch is collected before any callback runs; entries scheduled
        // from inside a callback fire no earlier than the next iteration.
        let batch = self.inner.sched.borrow_mut().pop_expired();
        for (id, cb) in batch {
            #[cfg(feature = "log")]
            log::trace!(target: "evloop", "Dispatching timer {id}");
            cb(self);
        }
    }

    fn rearm_kernel_timer(&self) -> Result<(), Error> {
        let next = self.inner.sched.borrow_mut().next_deadline_ns();
        let mut timer = self.inner.timer.borrow_mut();
        match next {
            Some(deadline) => timer.arm_at(deadline)?,
            None => timer.disarm()?,
        }
        Ok(())
    }

    fn dispatch_ready(&self) {
        loop {
            let event = self.inner.poller.borrow_mut().next_event();
            let Some((fd, mask)) = event else { break };
            self.dispatch_event(fd, mask);
        }
    }

    /// Dispatch one readiness event. Order within the event is error, then
    /// read, then write; the watcher table is consulted again between steps
    /// because any callback may cancel or replace the registration.
    fn dispatch_event(&self, fd: RawFd, mask: Readiness) {
        let Some(watcher) = self.inner.watchers.borrow().get(&fd).cloned() else {
            #[cfg(feature = "log")]
            log::trace!(target: "evloop", "Dropping {mask} event for unwatched fd={fd}");
            return;
        };

        // The descriptor number may have been closed and reused since the
        // event was queued; dispatch only if it still names the same file
        if watcher.fd != fd || fd_ident(fd).ok() != Some(watcher.ident) {
            #[cfg(feature = "log")]
            log::debug!(target: "evloop", "Purging watcher for reused fd={fd}");
            self.inner.remove_watcher(&watcher);
            return;
        }

        #[cfg(feature = "log")]
        log::trace!(target: "evloop", "Dispatching {mask} for fd={fd}");

        let handle = Watcher::from_inner(watcher.clone());

        let mut forced = false;
        if mask.contains(Readiness::ERR) {
            if watcher.error_live() {
                self.invoke(&watcher.error_cb, fd, &handle);
                if watcher.one_shot.get() && self.is_current(&watcher) {
                    self.inner.remove_watcher(&watcher);
                }
                return;
            }
            // No error handler: surface the condition through both
            // directions so the user notices on the next read or write
            forced = true;
        }

        let read_trig =
            mask.contains(Readiness::READABLE) || mask.contains(Readiness::HUP) || forced;
        let write_trig = mask.contains(Readiness::WRITABLE) || forced;

        if read_trig && watcher.read_live() {
            self.invoke(&watcher.read_cb, fd, &handle);
        }
        // The read callback may have cancelled or replaced the registration
        if !self.is_current(&watcher) {
            return;
        }
        if write_trig && watcher.write_live() {
            self.invoke(&watcher.write_cb, fd, &handle);
        }
        if watcher.one_shot.get() && self.is_current(&watcher) {
            #[cfg(feature = "log")]
            log::trace!(target: "evloop", "One-shot watcher for fd={fd} retires");
            self.inner.remove_watcher(&watcher);
        }
    }

    fn invoke(&self, slot: &RefCell<Option<IoCb>>, fd: RawFd, handle: &Watcher) {
        let cb = slot.borrow().clone();
        if let Some(cb) = cb {
            (*cb.borrow_mut())(self, fd, handle);
        }
    }

    fn is_current(&self, watcher: &Rc<WatcherInner>) -> bool {
        self.inner
            .watchers
            .borrow()
            .get(&watcher.fd)
            .map_or(false, |cur| Rc::ptr_eq(cur, watcher))
    }
}

impl LoopInner {
    /// Drop a watcher from the table and the backend. The table is the
    /// authority: backend removal failures are teardown races with the user
    /// closing the descriptor and stay silent.
    pub(crate) fn remove_watcher(&self, watcher: &Rc<WatcherInner>) -> bool {
        {
            let mut table = self.watchers.borrow_mut();
            match table.get(&watcher.fd) {
                Some(cur) if Rc::ptr_eq(cur, watcher) => {
                    table.remove(&watcher.fd);
                }
                _ => return false,
            }
        }
        watcher.active.set(false);
        self.poller.borrow_mut().unwatch(watcher.fd);
        #[cfg(feature = "log")]
        log::debug!(target: "evloop", "Unwatched fd={}", watcher.fd);
        true
    }

    /// Push a watcher's current interest down to the backend. Runs through
    /// modify so that an unchanged mask still re-arms a one-shot
    /// registration; backends without modify are re-registered from scratch.
    pub(crate) fn sync_interest(&self, watcher: &WatcherInner) -> Result<(), Error> {
        let interest = watcher.interest();
        let mut poller = self.poller.borrow_mut();
        if !poller.modify(watcher.fd, interest)? {
            poller.unwatch(watcher.fd);
            poller.watch(watcher.fd, interest)?;
        }
        #[cfg(feature = "log")]
        log::trace!(target: "evloop", "Interest for fd={} set to {interest}", watcher.fd);
        Ok(())
    }
}

fn secs_to_ns_delta(seconds: f64) -> i64 {
    if !(seconds > 0.0) {
        // Covers negative values and NaN
        return 0;
    }
    (seconds * 1e9) as i64
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::os::unix::io::{FromRawFd, OwnedFd};

    use super::*;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(n, data.len() as isize);
    }

    /// Backend replaying a canned event sequence; used to synthesize masks
    /// the kernel would not produce on demand.
    struct ScriptPoll {
        script: Rc<RefCell<VecDeque<(RawFd, Readiness)>>>,
    }

    impl Poll for ScriptPoll {
        fn watch(&mut self, _fd: RawFd, _interest: Readiness) -> io::Result<()> { Ok(()) }
        fn modify(&mut self, _fd: RawFd, _interest: Readiness) -> io::Result<bool> { Ok(true) }
        fn unwatch(&mut self, _fd: RawFd) -> bool { true }
        fn wait(&mut self, _timeout: Option<Duration>) -> io::Result<usize> {
            Ok(self.script.borrow().len())
        }
        fn next_event(&mut self) -> Option<(RawFd, Readiness)> {
            self.script.borrow_mut().pop_front()
        }
    }

    fn scripted() -> (EventLoop, Rc<RefCell<VecDeque<(RawFd, Readiness)>>>) {
        let script = Rc::new(RefCell::new(VecDeque::new()));
        let evl = EventLoop::with_poller(Box::new(ScriptPoll { script: script.clone() })).unwrap();
        (evl, script)
    }

    #[test]
    fn timer_order_and_cancel() {
        let evl = EventLoop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        evl.after(0.010, move |_| l.borrow_mut().push("A")).unwrap();
        let l = log.clone();
        evl.after(0.030, move |_| l.borrow_mut().push("B")).unwrap();
        let l = log.clone();
        let x = evl.after(0.020, move |_| l.borrow_mut().push("X")).unwrap();
        assert!(evl.cancel(x));
        assert!(!evl.cancel(x), "cancel is idempotent");
        evl.after(0.060, |evl| evl.stop()).unwrap();

        evl.run().unwrap();
        assert_eq!(*log.borrow(), vec!["A", "B"]);
    }

    #[test]
    fn pipe_readable() {
        let evl = EventLoop::new().unwrap();
        let (r, w) = pipe();
        let buf = Rc::new(RefCell::new(Vec::new()));

        let b = buf.clone();
        evl.watch(
            &r,
            WatchSpec::new().on_read(move |evl, fd, watcher| {
                let mut chunk = [0u8; 4096];
                let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, 4096) };
                assert!(n > 0);
                b.borrow_mut().extend_from_slice(&chunk[..n as usize]);
                assert!(watcher.cancel());
                evl.stop();
            }),
        )
        .unwrap();

        let wfd = w.as_raw_fd();
        evl.after(0.020, move |_| write_all(wfd, b"hello")).unwrap();

        evl.run().unwrap();
        assert_eq!(buf.borrow().as_slice(), &b"hello"[..]);
    }

    #[test]
    fn absolute_deadline_scheduling() {
        let evl = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let deadline = evl.now_ns() as f64 / 1e9 + 0.020;
        evl.at(deadline, move |evl| {
            f.set(true);
            evl.stop();
        })
        .unwrap();

        evl.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn one_shot_never_fires_twice() {
        let evl = EventLoop::new().unwrap();
        let (r, w) = pipe();
        let count = Rc::new(Cell::new(0u32));

        let c = count.clone();
        evl.watch(
            &r,
            WatchSpec::new().one_shot(true).on_read(move |_evl, fd, _watcher| {
                c.set(c.get() + 1);
                let mut byte = [0u8; 1];
                unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            }),
        )
        .unwrap();

        let wfd = w.as_raw_fd();
        evl.after(0.020, move |_| write_all(wfd, b"a")).unwrap();
        evl.after(0.040, move |_| write_all(wfd, b"b")).unwrap();
        evl.after(0.080, |evl| evl.stop()).unwrap();

        evl.run().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn error_suppresses_read_and_write() {
        let (evl, script) = scripted();
        let (r, _w) = pipe();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let (h1, h2, h3) = (hits.clone(), hits.clone(), hits.clone());
        evl.watch(
            &r,
            WatchSpec::new()
                .on_read(move |_, _, _| h1.borrow_mut().push("read"))
                .on_write(move |_, _, _| h2.borrow_mut().push("write"))
                .on_error(move |_, _, _| h3.borrow_mut().push("error")),
        )
        .unwrap();

        script.borrow_mut().push_back((
            r.as_raw_fd(),
            Readiness::ERR | Readiness::READABLE | Readiness::WRITABLE,
        ));
        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), vec!["error"]);
    }

    #[test]
    fn error_without_handler_forces_both_directions() {
        let (evl, script) = scripted();
        let (r, _w) = pipe();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let (h1, h2) = (hits.clone(), hits.clone());
        evl.watch(
            &r,
            WatchSpec::new()
                .on_read(move |_, _, _| h1.borrow_mut().push("read"))
                .on_write(move |_, _, _| h2.borrow_mut().push("write")),
        )
        .unwrap();

        script.borrow_mut().push_back((r.as_raw_fd(), Readiness::ERR));
        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), vec!["read", "write"], "read strictly before write");
    }

    #[test]
    fn hup_forces_read() {
        let (evl, script) = scripted();
        let (r, _w) = pipe();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        evl.watch(&r, WatchSpec::new().on_read(move |_, _, _| h.borrow_mut().push("read")))
            .unwrap();

        script.borrow_mut().push_back((r.as_raw_fd(), Readiness::HUP));
        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), vec!["read"]);
    }

    #[test]
    fn replacement_silences_old_watcher() {
        let (evl, script) = scripted();
        let (r, _w) = pipe();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        let old = evl
            .watch(&r, WatchSpec::new().on_read(move |_, _, _| h.borrow_mut().push("old")))
            .unwrap();

        // Event queued for the descriptor before the replacement happens
        script.borrow_mut().push_back((r.as_raw_fd(), Readiness::READABLE));

        let h = hits.clone();
        evl.watch(&r, WatchSpec::new().on_read(move |_, _, _| h.borrow_mut().push("new")))
            .unwrap();
        assert!(!old.is_active());
        assert!(!old.cancel(), "replaced watcher is already gone");

        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), vec!["new"]);
    }

    #[test]
    fn reused_descriptor_is_purged_without_dispatch() {
        let (evl, script) = scripted();
        let (r, w) = pipe();
        let rfd = r.as_raw_fd();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        evl.watch(&r, WatchSpec::new().on_read(move |_, _, _| h.borrow_mut().push("read")))
            .unwrap();

        // Close both ends without unwatching; the number may now be reused
        drop(r);
        drop(w);
        let (_r2, _w2) = pipe();

        script.borrow_mut().push_back((rfd, Readiness::READABLE));
        evl.run_once(Some(Duration::ZERO)).unwrap();

        assert!(hits.borrow().is_empty(), "stale watcher must not dispatch");
        assert!(!evl.unwatch(&rfd), "stale watcher was purged");
    }

    #[test]
    fn unwatch_unknown_descriptor() {
        let evl = EventLoop::new().unwrap();
        let (r, _w) = pipe();
        assert!(!evl.unwatch(&r));
        evl.watch(&r, WatchSpec::new().on_read(|_, _, _| {})).unwrap();
        assert!(evl.unwatch(&r));
        assert!(!evl.unwatch(&r), "unwatch is idempotent");
    }

    #[test]
    fn mutators_fail_after_cancellation() {
        let evl = EventLoop::new().unwrap();
        let (r, _w) = pipe();
        let watcher = evl.watch(&r, WatchSpec::new().on_read(|_, _, _| {})).unwrap();
        assert!(watcher.cancel());
        assert!(!watcher.cancel());
        assert!(matches!(watcher.disable_read(), Err(Error::WatcherCancelled)));
        assert!(matches!(watcher.set_one_shot(true), Err(Error::WatcherCancelled)));
    }

    #[test]
    fn disabled_direction_does_not_dispatch() {
        let (evl, script) = scripted();
        let (r, _w) = pipe();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        let watcher = evl
            .watch(&r, WatchSpec::new().on_read(move |_, _, _| h.borrow_mut().push("read")))
            .unwrap();
        watcher.disable_read().unwrap();

        script.borrow_mut().push_back((r.as_raw_fd(), Readiness::READABLE));
        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert!(hits.borrow().is_empty());

        // Re-enabling restores dispatch
        watcher.enable_read().unwrap();
        script.borrow_mut().push_back((r.as_raw_fd(), Readiness::READABLE));
        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), vec!["read"]);
    }

    #[test]
    fn watcher_data_round_trip() {
        let evl = EventLoop::new().unwrap();
        let (r, _w) = pipe();
        let watcher = evl.watch(&r, WatchSpec::new().data(42u32)).unwrap();
        assert_eq!(
            watcher.data_mut().as_ref().and_then(|d| d.downcast_ref::<u32>()),
            Some(&42)
        );
        watcher.set_data(Some(Box::new("swapped")));
        assert_eq!(
            watcher.data_mut().as_ref().and_then(|d| d.downcast_ref::<&str>()),
            Some(&"swapped")
        );
    }

    #[test]
    fn stop_inside_timer_callback_skips_the_wait() {
        // Without the stop check between timer dispatch and the blocking
        // wait this would hang forever: no descriptor ever becomes ready.
        let evl = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        evl.after(0.0, move |evl| {
            f.set(true);
            evl.stop();
        })
        .unwrap();
        evl.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn zero_and_negative_delays_fire_next_iteration() {
        let evl = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));
        let c = count.clone();
        evl.after(0.0, move |_| c.set(c.get() + 1)).unwrap();
        let c = count.clone();
        evl.after(-3.0, move |_| c.set(c.get() + 1)).unwrap();
        evl.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn timer_ids_are_never_reused() {
        let evl = EventLoop::new().unwrap();
        let a = evl.after(10.0, |_| {}).unwrap();
        let b = evl.after(10.0, |_| {}).unwrap();
        evl.cancel(a);
        let c = evl.after(10.0, |_| {}).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn rescheduling_from_timer_callback() {
        let evl = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));

        fn tick(evl: &EventLoop, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            if count.get() < 3 {
                let c = count.clone();
                evl.after(0.005, move |evl| tick(evl, c)).unwrap();
            } else {
                evl.stop();
            }
        }

        let c = count.clone();
        evl.after(0.005, move |evl| tick(evl, c)).unwrap();
        evl.run().unwrap();
        assert_eq!(count.get(), 3);
    }
}
