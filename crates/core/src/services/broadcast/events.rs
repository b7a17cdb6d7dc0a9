//! Progress events published per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::session::BroadcastStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
}

/// Operator-facing log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A contact that could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    pub contact_id: i64,
    pub reason: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Event on a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum BroadcastEvent {
    Status(BroadcastStatus),
    Log(LogEntry),
    Issue(IssueRecord),
}

/// Current state of a session followed by its live events.
///
/// Live events are subscribed before the snapshot is read, so an event may
/// appear both in the snapshot and on `live`; none is lost.
pub struct BroadcastFeed {
    pub status: BroadcastStatus,
    /// Recent log lines, oldest first.
    pub logs: Vec<LogEntry>,
    /// Recent issues, oldest first.
    pub issues: Vec<IssueRecord>,
    pub live: mpsc::Receiver<BroadcastEvent>,
}

impl BroadcastFeed {
    /// Replay events for the snapshot, in the order a subscriber should see them.
    #[must_use]
    pub fn replay(&self) -> Vec<BroadcastEvent> {
        std::iter::once(BroadcastEvent::Status(self.status.clone()))
            .chain(self.logs.iter().cloned().map(BroadcastEvent::Log))
            .chain(self.issues.iter().cloned().map(BroadcastEvent::Issue))
            .collect()
    }
}
