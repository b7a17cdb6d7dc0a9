//! Pluggable time source.
//!
//! All scheduling math reads "now" from a [`Clock`] so tests can pin time and
//! staging deployments can compress long delays without touching the math.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Source of the current instant plus the policy for turning a logical delay
/// into a wall-clock wait.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Convert a logical delay into the real wait applied by the task queue.
    fn scale_delay(&self, delay: Duration) -> Duration {
        delay
    }
}

/// Clock shared between services.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock, no scaling.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that divides every queue delay by a constant factor.
///
/// Used in development to compress hours of reminder delays into seconds.
/// The computed `scheduled_at` instants are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct ScaledClock {
    factor: i32,
}

impl ScaledClock {
    /// Create a scaled clock. Factors below 1 are treated as 1.
    #[must_use]
    pub fn new(factor: u32) -> Self {
        Self {
            factor: i32::try_from(factor.max(1)).unwrap_or(i32::MAX),
        }
    }
}

impl Clock for ScaledClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn scale_delay(&self, delay: Duration) -> Duration {
        delay / self.factor
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock pinned at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to an absolute instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scaled_clock_divides_delay() {
        let clock = ScaledClock::new(60);
        assert_eq!(clock.scale_delay(Duration::hours(1)), Duration::minutes(1));
    }

    #[test]
    fn test_scaled_clock_zero_factor_is_identity() {
        let clock = ScaledClock::new(0);
        assert_eq!(clock.scale_delay(Duration::minutes(5)), Duration::minutes(5));
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), start + Duration::minutes(90));
        assert_eq!(clock.scale_delay(Duration::minutes(5)), Duration::minutes(5));
    }
}
