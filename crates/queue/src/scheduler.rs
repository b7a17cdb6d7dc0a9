//! Recurring job registration.

use tracing::info;

use crate::error::QueueError;
use crate::jobs::TaskPayload;
use crate::queue::TaskQueue;
use crate::task::{DedupePolicy, EnqueueOptions, Repeat};

/// A job that re-arms itself after every run.
#[derive(Debug, Clone)]
pub struct RecurringJob {
    /// Stable identity across restarts.
    pub key: String,
    pub payload: TaskPayload,
    pub repeat: Repeat,
}

impl RecurringJob {
    #[must_use]
    pub fn new(key: impl Into<String>, payload: TaskPayload, repeat: Repeat) -> Self {
        Self {
            key: key.into(),
            payload,
            repeat,
        }
    }
}

/// Register `job` at its next occurrence.
///
/// Registering the same key again replaces the pending occurrence, so calling
/// this on every startup leaves exactly one scheduled task.
pub async fn register_recurring(queue: &TaskQueue, job: RecurringJob) -> Result<String, QueueError> {
    let now = queue.clock().now();
    let first = job
        .repeat
        .next_after(now)
        .ok_or_else(|| QueueError::Invalid(format!("Recurring job {} never fires", job.key)))?;

    let task_id = queue
        .enqueue(
            job.payload,
            EnqueueOptions::default()
                .delay(first - now)
                .dedupe(job.key.as_str(), DedupePolicy::Replace)
                .repeat(job.repeat),
        )
        .await?;

    info!(key = %job.key, task_id = %task_id, first = %first, "Recurring job registered");
    Ok(task_id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::jobs::queues;
    use crate::retry::RetryConfig;
    use chrono::{TimeZone, Utc};
    use herald_common::{ManualClock, TimeOfDay};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reregistration_keeps_one_task() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::default());
        let queue = TaskQueue::new(backend.clone(), clock, RetryConfig::default());

        let job = RecurringJob::new(
            "sweep",
            TaskPayload::ReachabilitySweep,
            Repeat::Daily {
                at: TimeOfDay::new(4, 0).unwrap(),
                timezone: chrono_tz::UTC,
            },
        );

        register_recurring(&queue, job.clone()).await.unwrap();
        register_recurring(&queue, job).await.unwrap();

        let tasks = backend.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].not_before,
            Utc.with_ymd_and_hms(2025, 6, 2, 4, 0, 0).unwrap()
        );
        assert_eq!(queue.pending_count(queues::MAINTENANCE).await.unwrap(), 1);
    }
}
