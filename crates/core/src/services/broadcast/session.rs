//! Broadcast session state as persisted in the state store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use herald_queue::pubsub_channels;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::services::delivery::MediaItem;

/// Field names of the session status hash.
pub mod fields {
    pub const STATE: &str = "state";
    pub const TOTAL: &str = "total";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const SKIPPED: &str = "skipped";
    pub const CURSOR: &str = "cursor";
    pub const CREATED_AT: &str = "createdAt";
    pub const STARTED_AT: &str = "startedAt";
    pub const FINISHED_AT: &str = "finishedAt";
    pub const RATE: &str = "rate";
    pub const ETA: &str = "etaSeconds";
}

/// Lifecycle of a broadcast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Queued,
    Running,
    Stopping,
    Stopped,
    Completed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether batches of the session may still be queued or running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Stopping)
    }
}

/// State store keys of one session.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Status hash.
    pub status: String,
    /// JSON array of contact ids.
    pub contacts: String,
    /// JSON [`BroadcastPayload`].
    pub payload: String,
    /// Cooperative stop flag.
    pub stop: String,
    pub logs: String,
    pub issues: String,
    /// Recent call durations in milliseconds.
    pub durations: String,
    /// Items processed per batch, keyed by batch start.
    pub progress: String,
    /// Current batches, batch start to batch end.
    pub batches: String,
    /// Pub/Sub channel.
    pub events: String,
}

impl SessionKeys {
    #[must_use]
    pub fn new(prefix: &str, session_id: &str) -> Self {
        let base = format!("{prefix}:broadcast:{session_id}");
        Self {
            status: format!("{base}:status"),
            contacts: format!("{base}:contacts"),
            payload: format!("{base}:payload"),
            stop: format!("{base}:stop"),
            logs: format!("{base}:logs"),
            issues: format!("{base}:issues"),
            durations: format!("{base}:durations"),
            progress: format!("{base}:progress"),
            batches: format!("{base}:batches"),
            events: pubsub_channels::broadcast_events(prefix, session_id),
        }
    }
}

/// Request to start a broadcast.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartBroadcast {
    #[validate(length(min = 1, message = "contacts must not be empty"))]
    pub contacts: Vec<i64>,
    /// HTML text, or the caption when media is attached.
    #[validate(length(max = 4096))]
    pub text: Option<String>,
    #[serde(default)]
    #[validate(length(max = 50))]
    pub media: Vec<MediaItem>,
    /// Requested spacing between sends; never below the configured floor.
    pub pacing_ms: Option<u64>,
    /// Count contacts already flagged unreachable as skipped without calling out.
    #[serde(default)]
    pub skip_unreachable: bool,
}

/// What every contact of a session receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub text: Option<String>,
    pub media: Vec<MediaItem>,
    pub pacing_ms: Option<u64>,
    pub skip_unreachable: bool,
}

impl From<&StartBroadcast> for BroadcastPayload {
    fn from(input: &StartBroadcast) -> Self {
        Self {
            text: input.text.clone().filter(|t| !t.trim().is_empty()),
            media: input.media.clone(),
            pacing_ms: input.pacing_ms,
            skip_unreachable: input.skip_unreachable,
        }
    }
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub id: String,
    pub state: SessionState,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Index of the next contact to process.
    pub cursor: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Smoothed sends per second.
    pub rate: f64,
    pub eta_seconds: Option<u64>,
    pub stop_requested: bool,
}

impl BroadcastStatus {
    /// Parse the status hash. Returns `None` for an unknown session.
    #[must_use]
    pub fn from_fields(id: &str, map: &HashMap<String, String>, stop_requested: bool) -> Option<Self> {
        let state = SessionState::parse(map.get(fields::STATE)?)?;
        let count = |field: &str| {
            map.get(field)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let instant = |field: &str| {
            map.get(field)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.to_utc())
        };

        Some(Self {
            id: id.to_string(),
            state,
            total: count(fields::TOTAL),
            success: count(fields::SUCCESS),
            failed: count(fields::FAILED),
            skipped: count(fields::SKIPPED),
            cursor: count(fields::CURSOR),
            created_at: instant(fields::CREATED_AT),
            started_at: instant(fields::STARTED_AT),
            finished_at: instant(fields::FINISHED_AT),
            rate: map
                .get(fields::RATE)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            eta_seconds: map.get(fields::ETA).and_then(|v| v.parse::<u64>().ok()),
            stop_requested,
        })
    }

    /// Contacts with a final outcome.
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.success + self.failed + self.skipped
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed())
    }
}

/// Split `[from, total)` into consecutive ranges of at most `size` items.
#[must_use]
pub fn split_batches(from: u64, total: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut batches = Vec::new();
    let mut start = from;
    while start < total {
        let end = start.saturating_add(size).min(total);
        batches.push((start, end));
        start = end;
    }
    batches
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_split_batches() {
        assert_eq!(split_batches(0, 1200, 500), vec![(0, 500), (500, 1000), (1000, 1200)]);
        assert_eq!(split_batches(200, 500, 500), vec![(200, 500)]);
        assert!(split_batches(500, 500, 500).is_empty());
    }

    #[test]
    fn test_status_from_fields() {
        let map: HashMap<String, String> = [
            (fields::STATE, "running"),
            (fields::TOTAL, "10"),
            (fields::SUCCESS, "4"),
            (fields::FAILED, "1"),
            (fields::CURSOR, "5"),
            (fields::RATE, "2.5"),
            (fields::STARTED_AT, "2025-05-10T12:00:00Z"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let status = BroadcastStatus::from_fields("s1", &map, false).unwrap();
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(status.processed(), 5);
        assert_eq!(status.remaining(), 5);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_none());
        assert!((status.rate - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_session_has_no_status() {
        assert!(BroadcastStatus::from_fields("s1", &HashMap::new(), false).is_none());
    }

    #[test]
    fn test_validation() {
        let input = StartBroadcast {
            contacts: Vec::new(),
            text: Some("hi".to_string()),
            media: Vec::new(),
            pacing_ms: None,
            skip_unreachable: false,
        };
        assert!(input.validate().is_err());
    }
}
