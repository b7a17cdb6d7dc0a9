//! Task handlers and the worker pool that drives them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::TaskError;
use crate::jobs::TaskPayload;
use crate::queue::TaskQueue;
use crate::task::Task;

/// Polls between stalled-task sweeps.
const RECOVERY_EVERY_POLLS: u64 = 120;

/// Delivery metadata passed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: String,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl TaskContext {
    /// Whether a retryable failure now would be the last one.
    #[must_use]
    pub const fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl From<&Task> for TaskContext {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            attempt: task.attempts.max(1),
            max_attempts: task.max_attempts,
        }
    }
}

/// Handler for delivered tasks.
///
/// Handlers must tolerate re-delivery of the same task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, payload: &TaskPayload) -> Result<(), TaskError>;
}

/// Pulls due tasks and runs them with a per-queue concurrency ceiling.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    poll_interval: Duration,
    queues: Vec<(String, usize)>,
}

impl WorkerPool {
    /// Create a pool with no queues registered.
    #[must_use]
    pub fn new(queue: Arc<TaskQueue>, handler: Arc<dyn TaskHandler>, poll_interval: Duration) -> Self {
        Self {
            queue,
            handler,
            poll_interval,
            queues: Vec::new(),
        }
    }

    /// Serve `queue` with at most `concurrency` tasks in flight.
    #[must_use]
    pub fn register(mut self, queue: &str, concurrency: usize) -> Self {
        self.queues.push((queue.to_string(), concurrency.max(1)));
        self
    }

    /// Spawn one poll loop per registered queue.
    #[must_use]
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = JoinSet::new();

        for (name, concurrency) in self.queues {
            info!(queue = %name, concurrency, "Starting worker");
            loops.spawn(poll_loop(
                self.queue.clone(),
                self.handler.clone(),
                name,
                concurrency,
                self.poll_interval,
                shutdown_rx.clone(),
            ));
        }

        WorkerHandle {
            shutdown: shutdown_tx,
            loops,
        }
    }
}

/// Running worker pool.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    loops: JoinSet<()>,
}

impl WorkerHandle {
    /// Stop claiming new tasks and wait for in-flight handlers to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(result) = self.loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker loop panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn poll_loop(
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    name: String,
    concurrency: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();
    let mut ticker = tokio::time::interval(poll_interval);
    let mut polls: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                error!(queue = %name, error = %e, "Task handler panicked");
            }
        }

        if polls % RECOVERY_EVERY_POLLS == 0 {
            if let Err(e) = queue.recover_stalled(&name).await {
                warn!(queue = %name, error = %e, "Failed to recover stalled tasks");
            }
        }
        polls = polls.wrapping_add(1);

        let available = permits.available_permits();
        if available == 0 {
            continue;
        }

        let tasks = match queue.claim(&name, available).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(queue = %name, error = %e, "Failed to claim tasks");
                continue;
            }
        };

        for task in tasks {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let queue = queue.clone();
            let handler = handler.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                queue.execute(task, handler.as_ref()).await;
            });
        }
    }

    info!(queue = %name, in_flight = in_flight.len(), "Worker draining");
    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            error!(queue = %name, error = %e, "Task handler panicked");
        }
    }
}
