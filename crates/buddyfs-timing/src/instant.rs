use std::ops::{Add, Sub};

use crate::Duration;

/// A monotonic point in time, backed by [`std::time::Instant`].
///
/// `ZERO` stands in for "never happened" so `Repeater`'s first `maybe`/
/// `fired` call after construction always fires.
#[derive(Clone, Copy, Debug)]
pub struct Instant(Option<std::time::Instant>);

impl Instant {
    pub const ZERO: Self = Self(None);

    #[inline]
    pub fn now() -> Self {
        Self(Some(std::time::Instant::now()))
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        match self.0 {
            Some(t) => t.elapsed().into(),
            None => Duration::MAX,
        }
    }

    #[inline]
    pub fn elapsed_since(&self, since: Instant) -> Duration {
        match (self.0, since.0) {
            (Some(a), Some(b)) => a.saturating_duration_since(b).into(),
            _ => Duration::MAX,
        }
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        self.elapsed_since(other)
    }
}

impl Default for Instant {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for Instant {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.map(|t| t + std::time::Duration::from(rhs)))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0.and_then(|t| t.checked_sub(std::time::Duration::from(rhs))))
    }
}
