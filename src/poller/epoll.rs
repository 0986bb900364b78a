use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::poller::{Poll, Readiness};

/// How many kernel events are pulled out per wait syscall.
const EVENT_BATCH: usize = 64;

/// Readiness backend using the Linux `epoll` facility.
///
/// Registrations are level-triggered unless the interest mask carries
/// [`Readiness::EDGE`]; [`Readiness::ONE_SHOT`] maps onto `EPOLLONESHOT`, so
/// a fired registration stays in the kernel set disarmed until the next
/// modify call re-arms it.
pub struct Epoll {
    epfd: OwnedFd,
    events: VecDeque<(RawFd, Readiness)>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: empty!(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Readiness) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(interest),
            u64: fd as u64,
        };
        let ptr: *mut libc::epoll_event =
            if op == libc::EPOLL_CTL_DEL { std::ptr::null_mut() } else { &mut ev };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ptr) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poll for Epoll {
    fn watch(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<bool> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)?;
        Ok(true)
    }

    fn unwatch(&mut self, fd: RawFd) -> bool {
        // The kernel drops closed descriptors from the set on its own, so
        // ENOENT and EBADF here are ordinary teardown races.
        self.ctl(libc::EPOLL_CTL_DEL, fd, Readiness::NONE).is_ok()
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut buf: [libc::epoll_event; EVENT_BATCH] = unsafe { std::mem::zeroed() };
        let started = Instant::now();
        let mut remaining = timeout;
        let count = loop {
            let ms = match remaining {
                None => -1,
                Some(t) => timeout_ms(t),
            };
            let n = unsafe {
                libc::epoll_wait(self.epfd.as_raw_fd(), buf.as_mut_ptr(), EVENT_BATCH as i32, ms)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            // Interrupted by a signal; shorten the timeout and retry
            if let Some(t) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= t {
                    break 0;
                }
                remaining = Some(t - elapsed);
            }
        };

        for ev in &buf[..count] {
            self.events.push_back((ev.u64 as RawFd, readiness(ev.events)));
        }
        Ok(count)
    }

    fn next_event(&mut self) -> Option<(RawFd, Readiness)> { self.events.pop_front() }
}

fn timeout_ms(t: Duration) -> libc::c_int {
    // Round up so a sub-millisecond timeout sleeps rather than spins
    let ms = t.as_millis() + u128::from(t.subsec_nanos() % 1_000_000 != 0);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

fn epoll_bits(interest: Readiness) -> u32 {
    let mut bits = 0u32;
    if interest.contains(Readiness::READABLE) {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.contains(Readiness::WRITABLE) {
        bits |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Readiness::PRIO) {
        bits |= libc::EPOLLPRI as u32;
    }
    if interest.contains(Readiness::RDHUP) {
        bits |= libc::EPOLLRDHUP as u32;
    }
    if interest.contains(Readiness::EDGE) {
        bits |= libc::EPOLLET as u32;
    }
    if interest.contains(Readiness::ONE_SHOT) {
        bits |= libc::EPOLLONESHOT as u32;
    }
    bits
}

fn readiness(events: u32) -> Readiness {
    let mut mask = Readiness::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= Readiness::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= Readiness::WRITABLE;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        mask |= Readiness::PRIO;
    }
    if events & libc::EPOLLRDHUP as u32 != 0 {
        mask |= Readiness::RDHUP;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        mask |= Readiness::ERR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        mask |= Readiness::HUP;
    }
    mask
}
