//! Event loop ([`EventLoop`]) multiplexing Linux descriptor primitives on a
//! single thread: readiness polling (epoll), kernel timers (timerfd), signal
//! delivery (signalfd), cross-thread wake-ups (eventfd) and process-exit
//! notifications (pidfd).
//!
//! Every event source is expressed as a readable descriptor and dispatched
//! through one watcher abstraction. User code registers callbacks with
//! [`EventLoop::watch`], schedules timers with [`EventLoop::after`] and
//! [`EventLoop::at`], and subscribes to signals and child exits through the
//! adaptors ([`EventLoop::signal`], [`EventLoop::waker`], [`EventLoop::pid`]).
//!
//! The loop owns no user descriptor: cancelling a watcher de-registers it and
//! nothing else. All callbacks run on the loop thread; the only blocking call
//! is the poll inside [`EventLoop::run_once`].

#[macro_use]
extern crate amplify;

mod clock;
mod evloop;
mod pids;
pub mod poller;
mod sched;
mod signals;
mod timerfd;
mod watcher;
mod wakeup;

pub use clock::{Clock, MonotonicClock};
pub use evloop::{Error, EventLoop};
pub use pids::PidSub;
pub use poller::{Poll, Readiness};
pub use signals::SignalSub;
pub use timerfd::{KernelTimer, TimerFd};
pub use watcher::{SubData, WatchSpec, Watcher};
pub use wakeup::Wakeup;
