//! Task queue used by services and workers.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use herald_common::{IdGenerator, SharedClock};
use tracing::{debug, error, info, warn};

use crate::backend::TaskBackend;
use crate::error::{QueueError, TaskError};
use crate::jobs::TaskPayload;
use crate::retry::RetryConfig;
use crate::task::{DeadLetter, EnqueueOptions, PushOutcome, Task};
use crate::workers::{TaskContext, TaskHandler};

/// Default lease of a claimed task.
const DEFAULT_LEASE_SECS: i64 = 300;

/// Shortest interval between two lease renewals.
const MIN_HEARTBEAT: std::time::Duration = std::time::Duration::from_millis(100);

/// Durable delayed task queue.
///
/// Delivery is at-least-once: a task runs no earlier than its `not_before`,
/// and a worker that dies mid-task leaves it to be reclaimed after the lease.
/// A live worker renews the lease every third of its length while the
/// handler runs.
pub struct TaskQueue {
    backend: Arc<dyn TaskBackend>,
    clock: SharedClock,
    retry: RetryConfig,
    lease: Duration,
    id_gen: IdGenerator,
}

impl TaskQueue {
    /// Create a queue over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn TaskBackend>, clock: SharedClock, retry: RetryConfig) -> Self {
        Self {
            backend,
            clock,
            retry,
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
            id_gen: IdGenerator::new(),
        }
    }

    /// Override how long a claimed task stays invisible to other workers.
    #[must_use]
    pub fn with_lease(mut self, lease: std::time::Duration) -> Self {
        self.lease = Duration::from_std(lease).unwrap_or(self.lease);
        self
    }

    /// Clock used for `not_before` math.
    #[must_use]
    pub const fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn not_before(&self, now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        now + self.clock.scale_delay(delay.max(Duration::zero()))
    }

    /// Schedule `payload` on its queue. Returns the id of the task that now
    /// holds the work, which is an existing task when deduplicated.
    pub async fn enqueue(
        &self,
        payload: TaskPayload,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let now = self.clock.now();
        let task = Task {
            id: self.id_gen.generate(),
            queue: payload.queue().to_string(),
            payload,
            not_before: self.not_before(now, options.delay),
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.retry.max_attempts)
                .max(1),
            dedupe_key: options.dedupe_key,
            repeat: options.repeat,
            created_at: now,
            last_error: None,
        };
        let id = task.id.clone();
        let queue = task.queue.clone();
        let not_before = task.not_before;

        match self.backend.push(task, options.dedupe_policy).await? {
            PushOutcome::Created => {
                debug!(task_id = %id, queue, %not_before, "Task enqueued");
                Ok(id)
            }
            PushOutcome::Existing(existing) => {
                debug!(task_id = %existing, queue, "Dedupe key held by live task, keeping it");
                Ok(existing)
            }
            PushOutcome::Replaced { previous } => {
                debug!(task_id = %id, previous = %previous, queue, "Task replaced");
                Ok(id)
            }
        }
    }

    /// Cancel a task that has not started. Missing or running tasks return `false`.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, QueueError> {
        let removed = self.backend.remove(task_id).await?;
        debug!(task_id, removed, "Task cancel requested");
        Ok(removed)
    }

    /// Cancel the live task holding `key`, if any.
    pub async fn cancel_by_dedupe_key(&self, key: &str) -> Result<bool, QueueError> {
        match self.backend.find_by_dedupe_key(key).await? {
            Some(task_id) => self.cancel(&task_id).await,
            None => Ok(false),
        }
    }

    /// Load a task in any state.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        self.backend.get(task_id).await
    }

    /// Claim up to `limit` due tasks of a queue.
    pub async fn claim(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.backend
            .claim_due(queue, self.clock.now(), self.lease, limit)
            .await
    }

    /// Requeue tasks whose worker stopped renewing them.
    pub async fn recover_stalled(&self, queue: &str) -> Result<usize, QueueError> {
        self.backend.recover_stalled(queue, self.clock.now()).await
    }

    /// Extend the lease of a running task from now.
    pub async fn renew_lease(&self, task: &Task) -> Result<bool, QueueError> {
        self.backend
            .extend_lease(task, self.clock.now() + self.lease)
            .await
    }

    fn heartbeat_period(&self) -> std::time::Duration {
        (self.lease / 3).to_std().unwrap_or(MIN_HEARTBEAT).max(MIN_HEARTBEAT)
    }

    /// Run a claimed task through `handler` and record the outcome.
    pub async fn execute(&self, task: Task, handler: &dyn TaskHandler) {
        let ctx = TaskContext::from(&task);
        debug!(
            task_id = %task.id,
            kind = task.payload.kind(),
            attempt = ctx.attempt,
            "Running task"
        );

        let period = self.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = {
            let handling = handler.handle(&ctx, &task.payload);
            tokio::pin!(handling);
            loop {
                tokio::select! {
                    result = &mut handling => break result,
                    _ = heartbeat.tick() => match self.renew_lease(&task).await {
                        Ok(true) => {}
                        Ok(false) => warn!(task_id = %task.id, "Lease lost while task was running"),
                        Err(e) => warn!(task_id = %task.id, error = %e, "Failed to renew lease"),
                    },
                }
            }
        };
        let task_id = task.id.clone();
        if let Err(e) = self.finish(task, result).await {
            error!(task_id = %task_id, error = %e, "Failed to record task outcome");
        }
    }

    /// Record the outcome of a claimed task: acknowledge, re-arm, retry or bury.
    pub async fn finish(
        &self,
        mut task: Task,
        result: Result<(), TaskError>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();

        let error = match result {
            Ok(()) => return self.rearm_or_complete(task, now).await,
            Err(error) => error,
        };

        let retry = error.is_retryable() && RetryConfig::should_retry(task.attempts, task.max_attempts);
        if retry {
            let backoff = Duration::from_std(self.retry.delay_for_attempt(task.attempts))
                .unwrap_or_else(|_| Duration::seconds(DEFAULT_LEASE_SECS));
            task.not_before = self.not_before(now, backoff);
            task.last_error = Some(error.to_string());
            warn!(
                task_id = %task.id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                retry_at = %task.not_before,
                error = %error,
                "Task failed, retrying"
            );
            return self.backend.reschedule(task).await;
        }

        if task.repeat.is_some() {
            warn!(task_id = %task.id, error = %error, "Recurring task failed, waiting for next occurrence");
            return self.rearm_or_complete(task, now).await;
        }

        error!(
            task_id = %task.id,
            kind = task.payload.kind(),
            attempts = task.attempts,
            error = %error,
            "Task moved to dead letters"
        );
        self.backend.bury(task, &error.to_string(), now).await
    }

    async fn rearm_or_complete(&self, mut task: Task, now: DateTime<Utc>) -> Result<(), QueueError> {
        let next = task.repeat.and_then(|repeat| repeat.next_after(now));
        let Some(next) = next else {
            return self.backend.complete(&task).await;
        };

        // A re-registration may have replaced this task while it was running.
        if let Some(key) = &task.dedupe_key {
            let holder = self.backend.find_by_dedupe_key(key).await?;
            if holder.as_deref() != Some(task.id.as_str()) {
                info!(task_id = %task.id, "Recurring task superseded, dropping it");
                return self.backend.complete(&task).await;
            }
        }

        task.not_before = self.not_before(now, next - now);
        task.attempts = 0;
        task.last_error = None;
        debug!(task_id = %task.id, next = %next, "Recurring task re-armed");
        self.backend.reschedule(task).await
    }

    /// Claim every task of `queue` due now and run them one after another.
    ///
    /// Returns how many tasks ran.
    pub async fn run_due(&self, queue: &str, handler: &dyn TaskHandler) -> Result<usize, QueueError> {
        let tasks = self.claim(queue, usize::MAX).await?;
        let count = tasks.len();
        for task in tasks {
            self.execute(task, handler).await;
        }
        Ok(count)
    }

    /// Tasks of a queue waiting to be claimed.
    pub async fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        self.backend.pending_count(queue).await
    }

    /// Most recent dead letters of a queue.
    pub async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.backend.dead_letters(queue, limit).await
    }
}
