//! In-process task backend.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::TaskBackend;
use crate::error::QueueError;
use crate::task::{DeadLetter, DedupePolicy, PushOutcome, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Delayed,
    Active { lease_until: DateTime<Utc> },
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, (Task, Slot)>,
    dedupe: HashMap<String, String>,
    dead: HashMap<String, VecDeque<DeadLetter>>,
}

impl Inner {
    fn release_dedupe(&mut self, task: &Task) {
        if let Some(key) = &task.dedupe_key {
            if self.dedupe.get(key) == Some(&task.id) {
                self.dedupe.remove(key);
            }
        }
    }
}

/// Task backend kept in memory. Nothing survives a restart.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    dead_letter_limit: usize,
}

impl MemoryBackend {
    /// Create an empty backend keeping at most `dead_letter_limit` dead tasks per queue.
    #[must_use]
    pub fn new(dead_letter_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            dead_letter_limit,
        }
    }

    /// Snapshot of every stored task, for assertions.
    pub async fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .lock()
            .await
            .tasks
            .values()
            .map(|(task, _)| task.clone())
            .collect();
        tasks.sort_by(|a, b| a.not_before.cmp(&b.not_before).then(a.id.cmp(&b.id)));
        tasks
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl TaskBackend for MemoryBackend {
    async fn push(&self, task: Task, policy: DedupePolicy) -> Result<PushOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut outcome = PushOutcome::Created;

        if let Some(key) = task.dedupe_key.clone() {
            let holder = inner
                .dedupe
                .get(&key)
                .filter(|id| inner.tasks.contains_key(*id))
                .cloned();

            if let Some(existing) = holder {
                match policy {
                    DedupePolicy::KeepExisting => return Ok(PushOutcome::Existing(existing)),
                    DedupePolicy::Replace => {
                        if matches!(inner.tasks.get(&existing), Some((_, Slot::Delayed))) {
                            inner.tasks.remove(&existing);
                        }
                        outcome = PushOutcome::Replaced { previous: existing };
                    }
                }
            }
            inner.dedupe.insert(key, task.id.clone());
        }

        inner.tasks.insert(task.id.clone(), (task, Slot::Delayed));
        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        Ok(self
            .inner
            .lock()
            .await
            .tasks
            .get(id)
            .map(|(task, _)| task.clone()))
    }

    async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.tasks.get(id), Some((_, Slot::Delayed))) {
            return Ok(false);
        }
        if let Some((task, _)) = inner.tasks.remove(id) {
            inner.release_dedupe(&task);
        }
        Ok(true)
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<String>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dedupe
            .get(key)
            .filter(|id| inner.tasks.contains_key(*id))
            .cloned())
    }

    async fn claim_due(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Task>, QueueError> {
        let mut inner = self.inner.lock().await;

        let mut due: Vec<(DateTime<Utc>, String)> = inner
            .tasks
            .values()
            .filter(|(task, slot)| {
                *slot == Slot::Delayed && task.queue == queue && task.not_before <= now
            })
            .map(|(task, _)| (task.not_before, task.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some((task, slot)) = inner.tasks.get_mut(&id) {
                task.attempts += 1;
                *slot = Slot::Active {
                    lease_until: now + lease,
                };
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, task: &Task, lease_until: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&task.id) {
            Some((_, slot @ Slot::Active { .. })) => {
                *slot = Slot::Active { lease_until };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stalled(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut recovered = 0;
        for (task, slot) in inner.tasks.values_mut() {
            let expired = matches!(*slot, Slot::Active { lease_until } if lease_until <= now);
            if expired && task.queue == queue {
                *slot = Slot::Delayed;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(&task.id);
        inner.release_dedupe(task);
        Ok(())
    }

    async fn reschedule(&self, task: Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.id.clone(), (task, Slot::Delayed));
        Ok(())
    }

    async fn bury(&self, task: Task, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(&task.id);
        inner.release_dedupe(&task);

        let limit = self.dead_letter_limit;
        let dead = inner.dead.entry(task.queue.clone()).or_default();
        dead.push_front(DeadLetter {
            task,
            error: error.to_string(),
            failed_at: now,
        });
        dead.truncate(limit);
        Ok(())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dead
            .get(queue)
            .map(|dead| dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|(task, slot)| *slot == Slot::Delayed && task.queue == queue)
            .count())
    }
}
