//! Task model and enqueue options.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use herald_common::{TimeOfDay, next_time_of_day};
use serde::{Deserialize, Serialize};

use crate::jobs::TaskPayload;

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub queue: String,
    pub payload: TaskPayload,
    /// Earliest delivery instant.
    pub not_before: DateTime<Utc>,
    /// Deliveries started so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub dedupe_key: Option<String>,
    pub repeat: Option<Repeat>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// What happens when a dedupe key is already taken by a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupePolicy {
    /// Keep the existing task and return its id.
    #[default]
    KeepExisting,
    /// Cancel the existing task if it has not started and enqueue the new one.
    Replace,
}

/// Recurrence of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Repeat {
    /// Every day at a local wall-clock time.
    Daily { at: TimeOfDay, timezone: Tz },
    /// At a fixed interval.
    Every { seconds: u64 },
}

impl Repeat {
    /// First occurrence strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Self::Daily { at, timezone } => {
                next_time_of_day(after + Duration::seconds(1), at, timezone)
            }
            Self::Every { seconds } => {
                let seconds = i64::try_from(seconds.max(1)).ok()?;
                after.checked_add_signed(Duration::seconds(seconds))
            }
        }
    }
}

/// Options for [`crate::TaskQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub dedupe_key: Option<String>,
    pub dedupe_policy: DedupePolicy,
    /// Overrides the queue default.
    pub max_attempts: Option<u32>,
    pub repeat: Option<Repeat>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::zero(),
            dedupe_key: None,
            dedupe_policy: DedupePolicy::KeepExisting,
            max_attempts: None,
            repeat: None,
        }
    }
}

impl EnqueueOptions {
    /// Run no earlier than `delay` from now. Negative delays run immediately.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay.max(Duration::zero());
        self
    }

    /// Make the enqueue idempotent on `key`.
    #[must_use]
    pub fn dedupe(mut self, key: impl Into<String>, policy: DedupePolicy) -> Self {
        self.dedupe_key = Some(key.into());
        self.dedupe_policy = policy;
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Re-arm the task after every run.
    #[must_use]
    pub const fn repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

/// Result of storing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored as a new task.
    Created,
    /// A live task already holds the dedupe key.
    Existing(String),
    /// The previous holder of the dedupe key was cancelled.
    Replaced { previous: String },
}

/// A task that exhausted its attempts or failed terminally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_daily_repeat_moves_to_next_day() {
        let repeat = Repeat::Daily {
            at: TimeOfDay::new(4, 0).unwrap(),
            timezone: chrono_tz::Europe::Berlin,
        };
        // Ran at 04:00 Berlin (03:00 UTC in winter).
        let ran = Utc.with_ymd_and_hms(2025, 1, 10, 3, 0, 0).unwrap();
        assert_eq!(
            repeat.next_after(ran),
            Some(Utc.with_ymd_and_hms(2025, 1, 11, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_every_repeat() {
        let repeat = Repeat::Every { seconds: 90 };
        let ran = Utc.with_ymd_and_hms(2025, 1, 10, 3, 0, 0).unwrap();
        assert_eq!(repeat.next_after(ran), Some(ran + Duration::seconds(90)));
    }

    #[test]
    fn test_negative_delay_is_clamped() {
        let options = EnqueueOptions::default().delay(Duration::minutes(-5));
        assert_eq!(options.delay, Duration::zero());
    }

    #[test]
    fn test_repeat_serde() {
        let repeat = Repeat::Daily {
            at: TimeOfDay::new(9, 30).unwrap(),
            timezone: chrono_tz::UTC,
        };
        let json = serde_json::to_string(&repeat).unwrap();
        let back: Repeat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, repeat);
    }
}
