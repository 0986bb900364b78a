use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Kernel timer the loop uses to wake itself at the next pending deadline.
///
/// At most one arming is outstanding at any time; re-arming replaces the
/// previous deadline. Expirations between reads coalesce, the count is not
/// meaningful beyond "at least one".
pub trait KernelTimer {
    /// One-shot arming at an absolute `CLOCK_MONOTONIC` deadline. Deadlines
    /// at or before now fire immediately.
    fn arm_at(&mut self, deadline_ns: i64) -> io::Result<()>;

    /// Cancel any pending wake.
    fn disarm(&mut self) -> io::Result<()>;

    /// Consume accumulated expirations; `Ok(0)` when none are pending.
    fn read_ticks(&mut self) -> io::Result<u64>;

    /// Readable descriptor to register with the poll backend.
    fn as_raw_fd(&self) -> RawFd;
}

/// [`KernelTimer`] backed by `timerfd_create(CLOCK_MONOTONIC)`.
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn settime(&self, deadline_ns: i64) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (deadline_ns % 1_000_000_000) as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(
                self.fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl KernelTimer for TimerFd {
    fn arm_at(&mut self, deadline_ns: i64) -> io::Result<()> {
        // An all-zero it_value disarms instead of firing, so a deadline in
        // the past is clamped to the first representable instant.
        self.settime(deadline_ns.max(1))
    }

    fn disarm(&mut self) -> io::Result<()> { self.settime(0) }

    fn read_ticks(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8)
            };
            if n == 8 {
                return Ok(u64::from_ne_bytes(buf));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(0),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    fn as_raw_fd(&self) -> RawFd { self.fd.as_raw_fd() }
}
