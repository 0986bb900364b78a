use std::cell::Cell;

/// Monotonic time axis measured in integer nanoseconds.
///
/// The loop ticks the clock once at the start of every iteration and once
/// after each kernel-timer wake; all scheduling decisions within one
/// iteration read the same cached value, so timer arming and expiry checks
/// can never disagree about "now".
pub trait Clock {
    /// Refresh the cached now from the underlying time source.
    fn tick(&self);

    /// The cached now, in nanoseconds.
    fn now_ns(&self) -> i64;

    /// Absolute deadline `delta_ns` from the cached now. Negative deltas
    /// clamp to zero.
    fn deadline_in_ns(&self, delta_ns: i64) -> i64 {
        self.now_ns().saturating_add(delta_ns.max(0))
    }

    /// Nanoseconds until `deadline` relative to the cached now; negative if
    /// the deadline already passed.
    fn remaining_ns(&self, deadline: i64) -> i64 { deadline - self.now_ns() }
}

/// [`Clock`] backed by `CLOCK_MONOTONIC`.
pub struct MonotonicClock {
    cached: Cell<i64>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            cached: Cell::new(raw_monotonic_ns()),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self { Self::new() }
}

impl Clock for MonotonicClock {
    fn tick(&self) { self.cached.set(raw_monotonic_ns()); }

    fn now_ns(&self) -> i64 { self.cached.get() }
}

fn raw_monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Can not fail for CLOCK_MONOTONIC on any supported kernel
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(ret, 0);
    (ts.tv_sec as i64) * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cached_until_tick() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(clock.now_ns(), a, "now must not move without a tick");
        clock.tick();
        assert!(clock.now_ns() > a);
    }

    #[test]
    fn deadline_arithmetic() {
        let clock = MonotonicClock::new();
        let now = clock.now_ns();
        assert_eq!(clock.deadline_in_ns(1_000), now + 1_000);
        assert_eq!(clock.deadline_in_ns(-5), now, "negative delta clamps to zero");
        assert_eq!(clock.remaining_ns(now + 7), 7);
        assert_eq!(clock.remaining_ns(now - 7), -7);
    }
}
