//! Redis task backend.
//!
//! Key layout under the configured prefix:
//!
//! - `{prefix}:task:{id}`: task JSON
//! - `{prefix}:queue:{queue}:delayed`: sorted set scored by `not_before` (ms)
//! - `{prefix}:queue:{queue}:active`: sorted set scored by lease expiry (ms)
//! - `{prefix}:queue:{queue}:dead`: list of dead letters, newest first
//! - `{prefix}:dedupe:{key}`: id of the task holding a dedupe key
//!
//! Moving a task between sets always starts with a `ZREM`; the caller that
//! removes the member owns the task, so concurrent workers never claim the
//! same task twice.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, SortedSetsInterface};
use fred::types::SetOptions;
use fred::types::config::Config as RedisConfig;
use tracing::{debug, info, warn};

use super::TaskBackend;
use crate::error::QueueError;
use crate::task::{DeadLetter, DedupePolicy, PushOutcome, Task};

/// Task backend stored in Redis.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    prefix: String,
    dead_letter_limit: usize,
}

impl RedisBackend {
    /// Wrap an initialized client.
    #[must_use]
    pub fn new(client: Client, prefix: impl Into<String>, dead_letter_limit: usize) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            dead_letter_limit,
        }
    }

    /// Connect to Redis at `url`.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        dead_letter_limit: usize,
    ) -> Result<Self, QueueError> {
        let config = RedisConfig::from_url(url)?;
        let client = Client::new(config, None, None, None);
        client.init().await?;

        info!("Redis task backend initialized");

        Ok(Self::new(client, prefix, dead_letter_limit))
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:task:{id}", self.prefix)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:delayed", self.prefix)
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:active", self.prefix)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:dead", self.prefix)
    }

    fn dedupe_key(&self, key: &str) -> String {
        format!("{}:dedupe:{key}", self.prefix)
    }

    async fn load(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let raw: Option<String> = self.client.get(self.task_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    async fn store(&self, task: &Task) -> Result<(), QueueError> {
        let json = serde_json::to_string(task)?;
        self.client
            .set::<(), _, _>(self.task_key(&task.id), json, None, None, false)
            .await?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, QueueError> {
        let count: i64 = self.client.exists(self.task_key(id)).await?;
        Ok(count > 0)
    }

    /// Keep `id` only if its task still exists.
    async fn live(&self, id: Option<String>) -> Result<Option<String>, QueueError> {
        match id {
            Some(id) => Ok(self.exists(&id).await?.then_some(id)),
            None => Ok(None),
        }
    }

    async fn release_dedupe(&self, task: &Task) -> Result<(), QueueError> {
        if let Some(key) = &task.dedupe_key {
            let dedupe_key = self.dedupe_key(key);
            let holder: Option<String> = self.client.get(dedupe_key.as_str()).await?;
            if holder.as_deref() == Some(task.id.as_str()) {
                self.client.del::<(), _>(dedupe_key.as_str()).await?;
            }
        }
        Ok(())
    }

    /// Resolve the dedupe key before storing `task`.
    async fn reserve_dedupe(
        &self,
        task: &Task,
        key: &str,
        policy: DedupePolicy,
    ) -> Result<PushOutcome, QueueError> {
        let dedupe_key = self.dedupe_key(key);
        let reserved: Option<String> = self
            .client
            .set(dedupe_key.as_str(), task.id.as_str(), None, Some(SetOptions::NX), false)
            .await?;
        if reserved.is_some() {
            return Ok(PushOutcome::Created);
        }

        let holder: Option<String> = self.client.get(dedupe_key.as_str()).await?;
        let live_holder = self.live(holder).await?;

        match (live_holder, policy) {
            (Some(existing), DedupePolicy::KeepExisting) => Ok(PushOutcome::Existing(existing)),
            (Some(existing), DedupePolicy::Replace) => {
                if !self.remove(&existing).await? {
                    debug!(task_id = %existing, "Replaced task already claimed");
                }
                self.client
                    .set::<(), _, _>(dedupe_key.as_str(), task.id.as_str(), None, None, false)
                    .await?;
                Ok(PushOutcome::Replaced { previous: existing })
            }
            (None, _) => {
                self.client
                    .set::<(), _, _>(dedupe_key.as_str(), task.id.as_str(), None, None, false)
                    .await?;
                Ok(PushOutcome::Created)
            }
        }
    }
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

#[async_trait]
impl TaskBackend for RedisBackend {
    async fn push(&self, task: Task, policy: DedupePolicy) -> Result<PushOutcome, QueueError> {
        let outcome = match task.dedupe_key.clone() {
            Some(key) => self.reserve_dedupe(&task, &key, policy).await?,
            None => PushOutcome::Created,
        };
        if let PushOutcome::Existing(_) = outcome {
            return Ok(outcome);
        }

        self.store(&task).await?;
        self.client
            .zadd::<(), _, _>(
                self.delayed_key(&task.queue),
                None,
                None,
                false,
                false,
                (score(task.not_before), task.id.as_str()),
            )
            .await?;

        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        self.load(id).await
    }

    async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let Some(task) = self.load(id).await? else {
            return Ok(false);
        };

        let removed: i64 = self
            .client
            .zrem(self.delayed_key(&task.queue), id)
            .await?;
        if removed == 0 {
            return Ok(false);
        }

        self.client.del::<(), _>(self.task_key(id)).await?;
        self.release_dedupe(&task).await?;
        Ok(true)
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<String>, QueueError> {
        let holder: Option<String> = self.client.get(self.dedupe_key(key)).await?;
        self.live(holder).await
    }

    async fn claim_due(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Task>, QueueError> {
        let delayed = self.delayed_key(queue);
        let ids: Vec<String> = self
            .client
            .zrangebyscore(
                delayed.as_str(),
                0.0_f64,
                score(now),
                false,
                Some((0, i64::try_from(limit).unwrap_or(i64::MAX))),
            )
            .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let removed: i64 = self.client.zrem(delayed.as_str(), id.as_str()).await?;
            if removed == 0 {
                continue;
            }

            let Some(mut task) = self.load(&id).await? else {
                warn!(task_id = %id, queue, "Dropping queue entry without task body");
                continue;
            };
            task.attempts += 1;
            self.store(&task).await?;
            self.client
                .zadd::<(), _, _>(
                    self.active_key(queue),
                    None,
                    None,
                    false,
                    false,
                    (score(now + lease), id.as_str()),
                )
                .await?;
            claimed.push(task);
        }

        Ok(claimed)
    }

    async fn extend_lease(&self, task: &Task, lease_until: DateTime<Utc>) -> Result<bool, QueueError> {
        // XX: never re-adds a task that was recovered or finished meanwhile.
        let changed: i64 = self
            .client
            .zadd(
                self.active_key(&task.queue),
                Some(SetOptions::XX),
                None,
                true,
                false,
                (score(lease_until), task.id.as_str()),
            )
            .await?;
        Ok(changed > 0)
    }

    async fn recover_stalled(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let active = self.active_key(queue);
        let ids: Vec<String> = self
            .client
            .zrangebyscore(active.as_str(), 0.0_f64, score(now), false, None)
            .await?;

        let mut recovered = 0;
        for id in ids {
            let removed: i64 = self.client.zrem(active.as_str(), id.as_str()).await?;
            if removed == 0 || !self.exists(&id).await? {
                continue;
            }
            self.client
                .zadd::<(), _, _>(
                    self.delayed_key(queue),
                    None,
                    None,
                    false,
                    false,
                    (score(now), id.as_str()),
                )
                .await?;
            recovered += 1;
        }

        if recovered > 0 {
            warn!(queue, recovered, "Recovered stalled tasks");
        }
        Ok(recovered)
    }

    async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        self.client
            .zrem::<(), _, _>(self.active_key(&task.queue), task.id.as_str())
            .await?;
        self.client.del::<(), _>(self.task_key(&task.id)).await?;
        self.release_dedupe(task).await
    }

    async fn reschedule(&self, task: Task) -> Result<(), QueueError> {
        self.store(&task).await?;
        self.client
            .zrem::<(), _, _>(self.active_key(&task.queue), task.id.as_str())
            .await?;
        self.client
            .zadd::<(), _, _>(
                self.delayed_key(&task.queue),
                None,
                None,
                false,
                false,
                (score(task.not_before), task.id.as_str()),
            )
            .await?;
        Ok(())
    }

    async fn bury(&self, task: Task, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.client
            .zrem::<(), _, _>(self.active_key(&task.queue), task.id.as_str())
            .await?;
        self.client.del::<(), _>(self.task_key(&task.id)).await?;
        self.release_dedupe(&task).await?;

        let dead = self.dead_key(&task.queue);
        let entry = serde_json::to_string(&DeadLetter {
            task,
            error: error.to_string(),
            failed_at: now,
        })?;
        self.client.lpush::<(), _, _>(dead.as_str(), entry).await?;
        let last = i64::try_from(self.dead_letter_limit)
            .unwrap_or(i64::MAX)
            .saturating_sub(1);
        self.client.ltrim::<(), _>(dead.as_str(), 0, last).await?;
        Ok(())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let last = i64::try_from(limit).unwrap_or(i64::MAX).saturating_sub(1);
        let raw: Vec<String> = self.client.lrange(self.dead_key(queue), 0, last).await?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(QueueError::from))
            .collect()
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        let count: i64 = self.client.zcard(self.delayed_key(queue)).await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
