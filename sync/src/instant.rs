use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic instant used for freshness and eviction bookkeeping.
///
/// Backed by [`tokio::time::Instant`] so that a paused test runtime can
/// advance it deterministically.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(pub tokio::time::Instant);

impl Instant {
    /// Get the current time.
    pub fn now() -> Self {
        Instant(tokio::time::Instant::now())
    }

    /// `self + duration`, or `None` when the result is unrepresentable
    /// (e.g. a `Duration::MAX` stale time).
    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        self.0.checked_add(duration).map(Instant)
    }

    /// Time elapsed since this instant.
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Time from now until `self`, zero if already passed.
    pub fn saturating_until(&self) -> Duration {
        self.0.saturating_duration_since(tokio::time::Instant::now())
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Self::Output {
        self.0.saturating_duration_since(rhs.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// Saturates far in the future instead of overflowing.
    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs)
            .unwrap_or_else(|| Instant(self.0 + FAR_FUTURE))
    }
}

// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

impl std::fmt::Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Instant")
            .field(&self.elapsed().as_millis())
            .finish()
    }
}
