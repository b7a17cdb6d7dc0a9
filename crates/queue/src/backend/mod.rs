//! Task storage backends.
//!
//! A task lives in exactly one place at a time: the delayed set of its queue
//! (waiting for `not_before`), the active set (claimed by a worker under a
//! lease), or the dead-letter list. Only delayed tasks can be cancelled.

mod memory;
mod redis;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::QueueError;
use crate::task::{DeadLetter, DedupePolicy, PushOutcome, Task};

/// Durable storage for tasks.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Store a delayed task, honouring its dedupe key.
    ///
    /// A dedupe key whose task no longer exists is treated as free.
    async fn push(&self, task: Task, policy: DedupePolicy) -> Result<PushOutcome, QueueError>;

    /// Load a task in any state.
    async fn get(&self, id: &str) -> Result<Option<Task>, QueueError>;

    /// Remove a delayed task. Returns `false` if it is missing or already claimed.
    async fn remove(&self, id: &str) -> Result<bool, QueueError>;

    /// Id of the live task holding `key`, if any.
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Move up to `limit` due tasks to the active set, bumping their attempt count.
    async fn claim_due(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Task>, QueueError>;

    /// Push back the lease of an active task. Returns `false` if the task is
    /// no longer active.
    async fn extend_lease(&self, task: &Task, lease_until: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Return active tasks whose lease expired to the delayed set.
    async fn recover_stalled(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Delete a finished task and release its dedupe key.
    async fn complete(&self, task: &Task) -> Result<(), QueueError>;

    /// Put an active task back into the delayed set with its updated fields.
    async fn reschedule(&self, task: Task) -> Result<(), QueueError>;

    /// Move an active task to the dead-letter list.
    async fn bury(&self, task: Task, error: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Most recent dead letters of a queue, newest first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// Tasks of a queue that have not been claimed yet.
    async fn pending_count(&self, queue: &str) -> Result<usize, QueueError>;
}
