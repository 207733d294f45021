//! Absolute time on the HAL clock.

use core::ops::Add;
use core::time::Duration;

/// A point in time measured from the start of the HAL counter.
///
/// Keeps seconds and nanoseconds separately (via [`Duration`]) so deadlines do
/// not overflow even with a fast counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    pub const ZERO: Self = Self(Duration::ZERO);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(Duration::from_nanos(nanos))
    }

    pub const fn since_start(&self) -> Duration {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// Saturates at the largest representable instant.
    fn add(self, rhs: Duration) -> Instant {
        Self(self.0.saturating_add(rhs))
    }
}
