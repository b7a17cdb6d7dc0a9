//! Minimum-interval pacing for calls to the external channel.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

/// Spaces successive calls at least `interval` apart.
///
/// The interval never drops below the hard floor, whatever pacing the caller
/// asks for. Concurrent callers share the same spacing.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    /// Pacer that enforces only the floor.
    #[must_use]
    pub fn new(floor: Duration) -> Self {
        Self {
            interval: floor,
            last_call: Mutex::new(None),
        }
    }

    /// Pacer with a requested interval, clamped to `floor`.
    #[must_use]
    pub fn with_pacing(floor: Duration, pacing: Option<Duration>) -> Self {
        Self::new(pacing.map_or(floor, |pacing| pacing.max(floor)))
    }

    /// Effective spacing between calls.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next call may start, then record it as started.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            sleep_until(previous + self.interval).await;
        }
        *last_call = Some(Instant::now());
    }

    /// Push the next call back by `delay`, e.g. after a provider asked to slow down.
    pub async fn defer(&self, delay: Duration) {
        let mut last_call = self.last_call.lock().await;
        let resume = Instant::now() + delay;
        let base = resume.checked_sub(self.interval).unwrap_or(resume);
        *last_call = Some(last_call.map_or(base, |previous| previous.max(base)));
    }
}
