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

pub mod epoll;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::ops;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub use epoll::Epoll;

/// Readiness conditions for a watched descriptor.
///
/// The bit layout is frozen; tests and backends rely on the exact values.
/// `EDGE` and `ONE_SHOT` are registration modifiers rather than reportable
/// conditions, but they travel in the same mask so that a one-shot
/// registration can be re-armed from inside a callback with a single modify
/// call.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Debug)]
pub struct Readiness(u32);

impl Readiness {
    pub const NONE: Readiness = Readiness(0x00);
    /// Data can be read without blocking.
    pub const READABLE: Readiness = Readiness(0x01);
    /// Data can be written without blocking.
    pub const WRITABLE: Readiness = Readiness(0x02);
    /// Priority (out-of-band) data is pending.
    pub const PRIO: Readiness = Readiness(0x04);
    /// Peer closed its writing half.
    pub const RDHUP: Readiness = Readiness(0x08);
    /// Edge-triggered registration.
    pub const EDGE: Readiness = Readiness(0x10);
    /// Registration disarms after one reported event.
    pub const ONE_SHOT: Readiness = Readiness(0x20);
    /// Error condition; reported regardless of the interest mask.
    pub const ERR: Readiness = Readiness(0x40);
    /// Hang-up; reported regardless of the interest mask.
    pub const HUP: Readiness = Readiness(0x80);

    pub const fn bits(self) -> u32 { self.0 }

    pub const fn from_bits(bits: u32) -> Self { Readiness(bits) }

    pub const fn contains(self, other: Readiness) -> bool { self.0 & other.0 == other.0 }

    pub const fn intersects(self, other: Readiness) -> bool { self.0 & other.0 != 0 }

    pub const fn is_empty(self) -> bool { self.0 == 0 }
}

impl ops::BitOr for Readiness {
    type Output = Readiness;
    fn bitor(self, rhs: Readiness) -> Readiness { Readiness(self.0 | rhs.0) }
}

impl ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) { self.0 |= rhs.0 }
}

impl ops::BitAnd for Readiness {
    type Output = Readiness;
    fn bitand(self, rhs: Readiness) -> Readiness { Readiness(self.0 & rhs.0) }
}

impl Display for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const NAMES: [(Readiness, &str); 8] = [
            (Readiness::READABLE, "readable"),
            (Readiness::WRITABLE, "writable"),
            (Readiness::PRIO, "prio"),
            (Readiness::RDHUP, "rdhup"),
            (Readiness::EDGE, "edge"),
            (Readiness::ONE_SHOT, "one-shot"),
            (Readiness::ERR, "err"),
            (Readiness::HUP, "hup"),
        ];
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Readiness mechanism behind the event loop.
///
/// The loop keys its watcher table by raw descriptor and treats the backend
/// as a plain registration set: all dispatch policy stays in the loop. The
/// count returned by [`Poll::wait`] is informational only; callers drain
/// events through [`Poll::next_event`].
pub trait Poll {
    /// Register a descriptor with an interest mask.
    fn watch(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()>;

    /// Replace the interest mask of an existing registration. Backends
    /// without a native modify return `Ok(false)` and the loop falls back to
    /// unwatch-plus-watch. Implementations must issue the kernel update even
    /// when the mask is unchanged: a one-shot registration is re-armed by
    /// exactly such a no-op modify.
    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<bool> {
        let _ = (fd, interest);
        Ok(false)
    }

    /// De-register a descriptor. Gone-already conditions (closed descriptor,
    /// unknown registration) are reported as `false`, never as errors.
    fn unwatch(&mut self, fd: RawFd) -> bool;

    /// Block until at least one registered descriptor is ready or the
    /// timeout elapses. `None` blocks indefinitely, zero polls.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Pop the next collected readiness event.
    fn next_event(&mut self) -> Option<(RawFd, Readiness)>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frozen_bit_layout() {
        assert_eq!(Readiness::READABLE.bits(), 0x01);
        assert_eq!(Readiness::WRITABLE.bits(), 0x02);
        assert_eq!(Readiness::PRIO.bits(), 0x04);
        assert_eq!(Readiness::RDHUP.bits(), 0x08);
        assert_eq!(Readiness::EDGE.bits(), 0x10);
        assert_eq!(Readiness::ONE_SHOT.bits(), 0x20);
        assert_eq!(Readiness::ERR.bits(), 0x40);
        assert_eq!(Readiness::HUP.bits(), 0x80);
    }

    #[test]
    fn mask_ops() {
        let mask = Readiness::READABLE | Readiness::ERR;
        assert!(mask.contains(Readiness::READABLE));
        assert!(!mask.contains(Readiness::READABLE | Readiness::WRITABLE));
        assert!(mask.intersects(Readiness::READABLE | Readiness::WRITABLE));
        assert!(Readiness::NONE.is_empty());
        assert_eq!(mask.to_string(), "readable+err");
        assert_eq!(Readiness::NONE.to_string(), "none");
    }
}
