//! Absolute deadlines for timed waits.
//!
//! Timed operations throughout futexkit take an absolute deadline rather
//! than a relative duration: retry loops recompute the remaining time on
//! every iteration, so repeated spurious wakeups cannot stretch the total
//! wait. Both the monotonic clock and the wall clock are supported, since
//! condition variables may be configured with either.

use std::time::{Duration, Instant, SystemTime};

/// An absolute point in time against which remaining wait time is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// A deadline on the monotonic clock (immune to wall-clock steps).
    Monotonic(Instant),
    /// A deadline on the wall clock.
    Realtime(SystemTime),
}

impl Deadline {
    /// Deadline `timeout` from now, on the monotonic clock.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Deadline::Monotonic(Instant::now() + timeout)
    }

    /// Deadline at a specific monotonic instant.
    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Deadline::Monotonic(instant)
    }

    /// Deadline at a specific wall-clock time.
    #[must_use]
    pub fn at_realtime(when: SystemTime) -> Self {
        Deadline::Realtime(when)
    }

    /// Time left until the deadline, saturating at zero.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        match self {
            Deadline::Monotonic(at) => at.saturating_duration_since(Instant::now()),
            Deadline::Realtime(at) => at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        }
    }

    /// True once no wait time remains.
    #[must_use]
    pub fn has_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }
}
