//! Task queue integration tests against the in-memory backend.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use herald_common::{Clock, ManualClock, ScaledClock};
use herald_queue::{
    DedupePolicy, EnqueueOptions, MemoryBackend, Repeat, RetryConfig, TaskContext, TaskError,
    TaskHandler, TaskPayload, TaskQueue, queues,
};

/// Handler that replays scripted results and records what it saw.
#[derive(Default)]
struct Scripted {
    results: Mutex<VecDeque<Result<(), TaskError>>>,
    seen: Mutex<Vec<TaskContext>>,
}

impl Scripted {
    fn with(results: Vec<Result<(), TaskError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            seen: Mutex::default(),
        }
    }

    fn attempts(&self) -> Vec<u32> {
        self.seen.lock().unwrap().iter().map(|c| c.attempt).collect()
    }
}

#[async_trait]
impl TaskHandler for Scripted {
    async fn handle(&self, ctx: &TaskContext, _payload: &TaskPayload) -> Result<(), TaskError> {
        self.seen.lock().unwrap().push(ctx.clone());
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

fn setup() -> (Arc<ManualClock>, Arc<MemoryBackend>, TaskQueue) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap(),
    ));
    let backend = Arc::new(MemoryBackend::new(10));
    let queue = TaskQueue::new(backend.clone(), clock.clone(), RetryConfig::default())
        .with_lease(std::time::Duration::from_secs(60));
    (clock, backend, queue)
}

fn reminder(id: &str) -> TaskPayload {
    TaskPayload::Reminder {
        subscription_id: id.to_string(),
    }
}

#[tokio::test]
async fn test_task_not_delivered_before_delay() {
    let (clock, _backend, queue) = setup();
    let handler = Scripted::default();

    queue
        .enqueue(
            reminder("a"),
            EnqueueOptions::default().delay(Duration::minutes(10)),
        )
        .await
        .unwrap();

    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 0);

    clock.advance(Duration::minutes(10));
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 1);
    assert_eq!(queue.pending_count(queues::REMINDERS).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_before_delivery() {
    let (clock, _backend, queue) = setup();
    let handler = Scripted::default();

    let id = queue
        .enqueue(reminder("a"), EnqueueOptions::default().delay(Duration::hours(1)))
        .await
        .unwrap();

    assert!(queue.cancel(&id).await.unwrap());
    assert!(!queue.cancel(&id).await.unwrap());
    assert!(!queue.cancel("missing").await.unwrap());

    clock.advance(Duration::hours(2));
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 0);
}

#[tokio::test]
async fn test_claimed_task_cannot_be_cancelled() {
    let (_clock, _backend, queue) = setup();

    let id = queue
        .enqueue(reminder("a"), EnqueueOptions::default())
        .await
        .unwrap();
    let claimed = queue.claim(queues::REMINDERS, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    assert!(!queue.cancel(&id).await.unwrap());
}

#[tokio::test]
async fn test_dedupe_keep_existing() {
    let (_clock, backend, queue) = setup();

    let options = EnqueueOptions::default()
        .delay(Duration::minutes(5))
        .dedupe("reminder:a", DedupePolicy::KeepExisting);
    let first = queue.enqueue(reminder("a"), options.clone()).await.unwrap();
    let second = queue.enqueue(reminder("a"), options).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.tasks().await.len(), 1);
}

#[tokio::test]
async fn test_dedupe_replace() {
    let (clock, backend, queue) = setup();

    let first = queue
        .enqueue(
            reminder("a"),
            EnqueueOptions::default()
                .delay(Duration::minutes(5))
                .dedupe("offer-expire:x", DedupePolicy::Replace),
        )
        .await
        .unwrap();
    let second = queue
        .enqueue(
            reminder("a"),
            EnqueueOptions::default()
                .delay(Duration::minutes(30))
                .dedupe("offer-expire:x", DedupePolicy::Replace),
        )
        .await
        .unwrap();

    assert_ne!(first, second);
    let tasks = backend.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, second);
    assert_eq!(tasks[0].not_before, clock.now() + Duration::minutes(30));
}

#[tokio::test]
async fn test_dedupe_key_released_after_completion() {
    let (_clock, _backend, queue) = setup();
    let handler = Scripted::default();
    let options = EnqueueOptions::default().dedupe("k", DedupePolicy::KeepExisting);

    let first = queue.enqueue(reminder("a"), options.clone()).await.unwrap();
    queue.run_due(queues::REMINDERS, &handler).await.unwrap();

    let second = queue.enqueue(reminder("a"), options).await.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_cancel_by_dedupe_key() {
    let (_clock, backend, queue) = setup();

    queue
        .enqueue(
            reminder("a"),
            EnqueueOptions::default()
                .delay(Duration::minutes(1))
                .dedupe("broadcast:s:0", DedupePolicy::KeepExisting),
        )
        .await
        .unwrap();

    assert!(queue.cancel_by_dedupe_key("broadcast:s:0").await.unwrap());
    assert!(!queue.cancel_by_dedupe_key("broadcast:s:0").await.unwrap());
    assert!(backend.tasks().await.is_empty());
}

#[tokio::test]
async fn test_retry_with_backoff_then_dead_letter() {
    let (clock, _backend, queue) = setup();
    let handler = Scripted::with(vec![
        Err(TaskError::Retryable("timeout".into())),
        Err(TaskError::Retryable("timeout".into())),
        Err(TaskError::Retryable("timeout".into())),
    ]);

    queue
        .enqueue(reminder("a"), EnqueueOptions::default().max_attempts(3))
        .await
        .unwrap();

    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 1);

    // First backoff is 30s.
    clock.advance(Duration::seconds(29));
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 0);
    clock.advance(Duration::seconds(1));
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 1);

    // Second backoff is 60s.
    clock.advance(Duration::seconds(60));
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 1);

    assert_eq!(handler.attempts(), vec![1, 2, 3]);
    assert_eq!(queue.pending_count(queues::REMINDERS).await.unwrap(), 0);

    let dead = queue.dead_letters(queues::REMINDERS, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task.attempts, 3);
}

#[tokio::test]
async fn test_terminal_error_skips_retry() {
    let (_clock, _backend, queue) = setup();
    let handler = Scripted::with(vec![Err(TaskError::Terminal("bad payload".into()))]);

    queue
        .enqueue(reminder("a"), EnqueueOptions::default())
        .await
        .unwrap();
    queue.run_due(queues::REMINDERS, &handler).await.unwrap();

    assert_eq!(queue.pending_count(queues::REMINDERS).await.unwrap(), 0);
    let dead = queue.dead_letters(queues::REMINDERS, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].error.contains("bad payload"));
}

#[tokio::test]
async fn test_repeating_task_is_rearmed() {
    let (clock, backend, queue) = setup();
    let handler = Scripted::default();

    let id = queue
        .enqueue(
            TaskPayload::ReachabilitySweep,
            EnqueueOptions::default().repeat(Repeat::Every { seconds: 60 }),
        )
        .await
        .unwrap();

    assert_eq!(queue.run_due(queues::MAINTENANCE, &handler).await.unwrap(), 1);

    let tasks = backend.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].attempts, 0);
    assert_eq!(tasks[0].not_before, clock.now() + Duration::seconds(60));

    clock.advance(Duration::seconds(60));
    assert_eq!(queue.run_due(queues::MAINTENANCE, &handler).await.unwrap(), 1);
}

#[tokio::test]
async fn test_stalled_task_is_recovered() {
    let (clock, _backend, queue) = setup();
    let handler = Scripted::default();

    queue
        .enqueue(reminder("a"), EnqueueOptions::default())
        .await
        .unwrap();

    // Claimed by a worker that never reports back.
    assert_eq!(queue.claim(queues::REMINDERS, 10).await.unwrap().len(), 1);
    assert_eq!(queue.recover_stalled(queues::REMINDERS).await.unwrap(), 0);

    clock.advance(Duration::minutes(2));
    assert_eq!(queue.recover_stalled(queues::REMINDERS).await.unwrap(), 1);
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 1);
    assert_eq!(handler.attempts(), vec![2]);
}

/// Handler that keeps running well past the lease and, meanwhile, tries to
/// take the same task from another worker's point of view.
struct Lingering {
    clock: Arc<ManualClock>,
    queue: Arc<TaskQueue>,
    reclaimed: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskHandler for Lingering {
    async fn handle(&self, _ctx: &TaskContext, _payload: &TaskPayload) -> Result<(), TaskError> {
        for _ in 0..3 {
            self.clock.advance(Duration::seconds(45));
            tokio::time::sleep(std::time::Duration::from_secs(25)).await;

            self.queue.recover_stalled(queues::REMINDERS).await.unwrap();
            let stolen = self.queue.claim(queues::REMINDERS, 10).await.unwrap();
            self.reclaimed
                .lock()
                .unwrap()
                .extend(stolen.into_iter().map(|task| task.id));
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_running_task_keeps_its_lease() {
    let (clock, backend, _) = setup();
    let queue = Arc::new(
        TaskQueue::new(backend.clone(), clock.clone(), RetryConfig::default())
            .with_lease(std::time::Duration::from_secs(60)),
    );
    queue
        .enqueue(reminder("slow"), EnqueueOptions::default())
        .await
        .unwrap();

    let handler = Lingering {
        clock: clock.clone(),
        queue: queue.clone(),
        reclaimed: Mutex::default(),
    };
    assert_eq!(queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 1);

    // 135s of handler time against a 60s lease, never handed out twice.
    assert!(handler.reclaimed.lock().unwrap().is_empty());
    assert!(backend.tasks().await.is_empty());
}

#[tokio::test]
async fn test_scaled_clock_compresses_delay() {
    let backend = Arc::new(MemoryBackend::default());
    let queue = TaskQueue::new(
        backend.clone(),
        Arc::new(ScaledClock::new(60)),
        RetryConfig::default(),
    );

    queue
        .enqueue(reminder("a"), EnqueueOptions::default().delay(Duration::hours(1)))
        .await
        .unwrap();

    let task = &backend.tasks().await[0];
    assert_eq!(task.not_before - task.created_at, Duration::minutes(1));
}
