//! Broadcast dispatcher.
//!
//! A session streams one payload to a fixed contact list. The list is split
//! into batch tasks; each batch walks its contacts in order, paced by a hard
//! minimum interval, and records outcomes with atomic counters in the state
//! store. Operators can stop a session between two contacts and resume it
//! later from `cursor`.

mod events;
mod rate;
mod session;

pub use events::{BroadcastEvent, BroadcastFeed, IssueRecord, LogEntry, LogLevel};
pub use rate::{RateEstimator, eta_seconds, median_ms};
pub use session::{
    BroadcastPayload, BroadcastStatus, SessionKeys, SessionState, StartBroadcast, fields,
    split_batches,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use herald_common::config::BroadcastConfig;
use herald_common::{AppError, AppResult, IdGenerator, SharedClock};
use herald_db::SubjectStore;
use herald_db::gateway::is_reachable;
use herald_queue::{
    DedupePolicy, EnqueueOptions, EventBus, Pacer, StateStore, TaskError, TaskPayload, TaskQueue,
    dedupe,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use validator::Validate;

use super::delivery::{DeliveryError, DeliveryGateway};

/// Outcome of one contact.
enum ItemOutcome {
    Success,
    Skipped,
    Failed { reason: &'static str, detail: String },
}

/// Broadcast dispatcher.
pub struct BroadcastDispatcher {
    state: Arc<dyn StateStore>,
    events: EventBus<BroadcastEvent>,
    queue: Arc<TaskQueue>,
    gateway: Arc<dyn DeliveryGateway>,
    subjects: Arc<dyn SubjectStore>,
    config: BroadcastConfig,
    prefix: String,
    floor: Arc<Pacer>,
    estimator: RateEstimator,
    id_gen: IdGenerator,
}

impl BroadcastDispatcher {
    #[must_use]
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<TaskQueue>,
        gateway: Arc<dyn DeliveryGateway>,
        subjects: Arc<dyn SubjectStore>,
        config: BroadcastConfig,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            events: EventBus::new(state.clone()),
            state,
            queue,
            gateway,
            subjects,
            floor: Arc::new(Pacer::new(Duration::from_millis(config.min_interval_ms))),
            estimator: RateEstimator::new(config.rate_alpha),
            config,
            prefix: prefix.into(),
            id_gen: IdGenerator::new(),
        }
    }

    /// The pacer spacing every call to the channel.
    #[must_use]
    pub fn pacer(&self) -> Arc<Pacer> {
        self.floor.clone()
    }

    fn keys(&self, session_id: &str) -> SessionKeys {
        SessionKeys::new(&self.prefix, session_id)
    }

    fn clock(&self) -> &SharedClock {
        self.queue.clock()
    }

    // ==================== Operator API ====================

    /// Create a session and queue its batches.
    pub async fn start(&self, input: StartBroadcast) -> AppResult<BroadcastStatus> {
        input.validate()?;
        let payload = BroadcastPayload::from(&input);
        if payload.text.is_none() && payload.media.is_empty() {
            return Err(AppError::Validation(
                "Either text or media must be provided".to_string(),
            ));
        }

        let session_id = self.id_gen.generate();
        let keys = self.keys(&session_id);
        let total = input.contacts.len() as u64;
        let now = self.clock().now();

        self.state
            .set(&keys.contacts, &serde_json::to_string(&input.contacts)?)
            .await?;
        self.state
            .set(&keys.payload, &serde_json::to_string(&payload)?)
            .await?;
        self.state
            .hash_set(
                &keys.status,
                &[
                    (fields::STATE, SessionState::Queued.as_str().to_string()),
                    (fields::TOTAL, total.to_string()),
                    (fields::SUCCESS, "0".to_string()),
                    (fields::FAILED, "0".to_string()),
                    (fields::SKIPPED, "0".to_string()),
                    (fields::CURSOR, "0".to_string()),
                    (fields::CREATED_AT, now.to_rfc3339()),
                    (fields::RATE, "0".to_string()),
                ],
            )
            .await?;

        let batches = self.enqueue_batches(&session_id, &keys, 0, total).await?;
        self.log(&keys, LogLevel::Info, format!("Queued {total} contacts in {batches} batches"))
            .await?;
        info!(session_id = %session_id, total, batches, "Broadcast queued");

        self.publish_status(&session_id, &keys).await
    }

    /// Current status of a session.
    pub async fn status(&self, session_id: &str) -> AppResult<BroadcastStatus> {
        self.load_status(session_id, &self.keys(session_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Broadcast not found: {session_id}")))
    }

    /// Ask a session to stop after the contact in flight.
    ///
    /// Stopping a completed or stopped session changes nothing.
    pub async fn request_stop(&self, session_id: &str) -> AppResult<BroadcastStatus> {
        let keys = self.keys(session_id);
        let status = self.status(session_id).await?;
        if matches!(status.state, SessionState::Completed | SessionState::Stopped) {
            debug!(session_id, state = ?status.state, "Stop requested on finished session");
            return Ok(status);
        }

        self.state.set(&keys.stop, "1").await?;
        self.set_state(&keys, SessionState::Stopping).await?;
        self.publish_status(session_id, &keys).await?;

        let canceled = self.cancel_batches(session_id, &keys).await?;
        self.set_state(&keys, SessionState::Stopped).await?;
        self.log(
            &keys,
            LogLevel::Info,
            format!("Stop requested, {canceled} queued batches cancelled"),
        )
        .await?;
        info!(session_id, canceled, "Broadcast stopped");

        self.publish_status(session_id, &keys).await
    }

    /// Continue a stopped session from its cursor.
    pub async fn resume(&self, session_id: &str) -> AppResult<BroadcastStatus> {
        let keys = self.keys(session_id);
        let status = self.status(session_id).await?;
        match status.state {
            SessionState::Stopped => {}
            SessionState::Completed => {
                return Err(AppError::Conflict(format!("Broadcast already completed: {session_id}")));
            }
            state => {
                return Err(AppError::Conflict(format!(
                    "Broadcast is {}: {session_id}",
                    state.as_str()
                )));
            }
        }
        if status.cursor >= status.total {
            return Err(AppError::Conflict(format!("Broadcast has nothing left to send: {session_id}")));
        }
        if self.state.get(&keys.payload).await?.is_none() {
            return Err(AppError::NotFound(format!("Broadcast payload missing: {session_id}")));
        }

        self.state.delete(&keys.stop).await?;
        self.state.delete(&keys.progress).await?;
        self.state.hash_delete(&keys.status, fields::FINISHED_AT).await?;
        self.set_state(&keys, SessionState::Queued).await?;

        let batches = self
            .enqueue_batches(session_id, &keys, status.cursor, status.total)
            .await?;
        self.log(
            &keys,
            LogLevel::Info,
            format!("Resumed at {} of {}", status.cursor, status.total),
        )
        .await?;
        info!(session_id, cursor = status.cursor, total = status.total, batches, "Broadcast resumed");

        self.publish_status(session_id, &keys).await
    }

    /// Snapshot of a session plus its live events.
    pub async fn subscribe(&self, session_id: &str) -> AppResult<BroadcastFeed> {
        let keys = self.keys(session_id);
        let live = self.events.subscribe(&keys.events).await?;
        let status = self.status(session_id).await?;

        let logs = self
            .state
            .range(&keys.logs)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();
        let issues = self
            .state
            .range(&keys.issues)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        Ok(BroadcastFeed {
            status,
            logs,
            issues,
            live,
        })
    }

    // ==================== Batch handler ====================

    /// Send contacts `[start, end)` of a session.
    ///
    /// Re-delivery resumes after the last contact this batch recorded, so the
    /// counters never move by more than the batch size.
    pub async fn handle_batch(&self, session_id: &str, start: u64, end: u64) -> Result<(), TaskError> {
        let keys = self.keys(session_id);
        let Some(status) = self.load_status(session_id, &keys).await? else {
            warn!(session_id, "Batch for unknown broadcast");
            return Ok(());
        };
        if status.state == SessionState::Completed {
            debug!(session_id, start, "Broadcast already completed, dropping batch");
            return Ok(());
        }

        let batches = self.state.hash_get_all(&keys.batches).await?;
        if batches.get(&start.to_string()) != Some(&end.to_string()) {
            debug!(session_id, start, end, "Stale batch, dropping");
            return Ok(());
        }
        if self.state.get(&keys.stop).await?.is_some() {
            debug!(session_id, start, "Broadcast stopped, dropping batch");
            return Ok(());
        }

        let now = self.clock().now();
        if status.state != SessionState::Running {
            self.set_state(&keys, SessionState::Running).await?;
        }
        if self
            .state
            .hash_set_nx(&keys.status, fields::STARTED_AT, &now.to_rfc3339())
            .await?
        {
            self.log(&keys, LogLevel::Info, "Broadcast started".to_string()).await?;
        }

        let contacts: Vec<i64> = match self.state.get(&keys.contacts).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| TaskError::Terminal(e.to_string()))?,
            None => return Err(TaskError::Terminal(format!("Contacts missing for {session_id}"))),
        };
        let payload: BroadcastPayload = match self.state.get(&keys.payload).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| TaskError::Terminal(e.to_string()))?,
            None => return Err(TaskError::Terminal(format!("Payload missing for {session_id}"))),
        };

        let progress_field = start.to_string();
        let done = self
            .state
            .hash_get_all(&keys.progress)
            .await?
            .get(&progress_field)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let session_pacer = payload
            .pacing_ms
            .map(|ms| Pacer::with_pacing(self.floor.interval(), Some(Duration::from_millis(ms))))
            .filter(|pacer| pacer.interval() > self.floor.interval());

        self.publish_status(session_id, &keys).await?;
        debug!(session_id, start, end, done, "Batch running");

        let mut since_publish: u64 = 0;
        let mut last_publish = Instant::now();

        for index in start.saturating_add(done)..end {
            if let Some(current) = self.load_status(session_id, &keys).await? {
                if current.state == SessionState::Completed {
                    debug!(session_id, index, "Broadcast completed elsewhere, aborting batch");
                    break;
                }
            }
            if self.state.get(&keys.stop).await?.is_some() {
                self.log(&keys, LogLevel::Info, format!("Stopped at {index}")).await?;
                info!(session_id, cursor = index, "Batch aborted by stop request");
                break;
            }

            let Some(contact_id) = usize::try_from(index).ok().and_then(|i| contacts.get(i)).copied() else {
                error!(session_id, index, "Contact index out of range");
                break;
            };

            let outcome = self
                .deliver(&keys, contact_id, &payload, session_pacer.as_ref())
                .await?;
            self.record(session_id, &keys, contact_id, outcome).await?;
            self.state.hash_incr(&keys.status, fields::CURSOR, 1).await?;
            self.state.hash_incr(&keys.progress, &progress_field, 1).await?;

            since_publish += 1;
            let cadence = Duration::from_millis(self.config.status_every_ms);
            if since_publish >= self.config.status_every_items.max(1) || last_publish.elapsed() >= cadence {
                self.refresh_rate(session_id, &keys).await?;
                self.publish_status(session_id, &keys).await?;
                since_publish = 0;
                last_publish = Instant::now();
            }
        }

        self.refresh_rate(session_id, &keys).await?;
        self.finish_if_done(session_id, &keys).await?;
        self.publish_status(session_id, &keys).await?;
        Ok(())
    }

    async fn deliver(
        &self,
        keys: &SessionKeys,
        contact_id: i64,
        payload: &BroadcastPayload,
        session_pacer: Option<&Pacer>,
    ) -> AppResult<ItemOutcome> {
        if payload.skip_unreachable {
            let subject = self.subjects.find_subject(contact_id).await?;
            if !is_reachable(subject.as_ref()) {
                return Ok(ItemOutcome::Skipped);
            }
        }

        let attempts = self.config.item_retry_attempts.saturating_add(1);
        let mut attempt = 0;
        let (outcome, elapsed) = loop {
            attempt += 1;
            if let Some(pacer) = session_pacer {
                pacer.wait().await;
            }
            self.floor.wait().await;

            let started = Instant::now();
            let result = self.send(contact_id, payload).await;
            let elapsed = started.elapsed();

            let error = match result {
                Ok(()) => break (ItemOutcome::Success, elapsed),
                Err(error) => error,
            };

            match error {
                DeliveryError::Permanent(detail) => {
                    if let Err(e) = self.subjects.mark_unreachable(contact_id, &detail).await {
                        warn!(contact_id, error = %e, "Failed to flag contact unreachable");
                    }
                    let outcome = ItemOutcome::Failed {
                        reason: "unreachable",
                        detail,
                    };
                    break (outcome, elapsed);
                }
                DeliveryError::RateLimited { retry_after } if attempt < attempts => {
                    debug!(contact_id, ?retry_after, "Rate limited, deferring");
                    self.floor.defer(retry_after).await;
                }
                DeliveryError::Transient(ref detail) if attempt < attempts => {
                    debug!(contact_id, attempt, detail = %detail, "Transient failure, retrying contact");
                }
                other => {
                    let outcome = ItemOutcome::Failed {
                        reason: other.reason(),
                        detail: other.to_string(),
                    };
                    break (outcome, elapsed);
                }
            }
        };

        // One sample per contact: the duration of its final call.
        let elapsed = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.state
            .push_bounded(&keys.durations, &elapsed.to_string(), self.config.duration_window)
            .await?;
        Ok(outcome)
    }

    async fn send(&self, contact_id: i64, payload: &BroadcastPayload) -> Result<(), DeliveryError> {
        if payload.media.is_empty() {
            let text = payload.text.as_deref().unwrap_or_default();
            self.gateway.send_message(contact_id, text).await.map(|_| ())
        } else {
            self.gateway
                .send_media(contact_id, &payload.media, payload.text.as_deref())
                .await
                .map(|_| ())
        }
    }

    async fn record(
        &self,
        session_id: &str,
        keys: &SessionKeys,
        contact_id: i64,
        outcome: ItemOutcome,
    ) -> AppResult<()> {
        match outcome {
            ItemOutcome::Success => {
                self.state.hash_incr(&keys.status, fields::SUCCESS, 1).await?;
            }
            ItemOutcome::Skipped => {
                self.state.hash_incr(&keys.status, fields::SKIPPED, 1).await?;
            }
            ItemOutcome::Failed { reason, detail } => {
                warn!(session_id, contact_id, reason, detail = %detail, "Broadcast delivery failed");
                self.state.hash_incr(&keys.status, fields::FAILED, 1).await?;
                let issue = IssueRecord {
                    contact_id,
                    reason: reason.to_string(),
                    detail,
                    at: self.clock().now(),
                };
                self.state
                    .push_bounded(&keys.issues, &serde_json::to_string(&issue)?, self.config.issue_capacity)
                    .await?;
                self.events
                    .publish(&keys.events, &BroadcastEvent::Issue(issue))
                    .await?;
            }
        }
        Ok(())
    }

    /// Close the session once every contact has an outcome.
    async fn finish_if_done(&self, session_id: &str, keys: &SessionKeys) -> AppResult<()> {
        let Some(status) = self.load_status(session_id, keys).await? else {
            return Ok(());
        };
        if status.processed() < status.total {
            return Ok(());
        }

        let now = self.clock().now();
        let first = self
            .state
            .hash_set_nx(&keys.status, fields::FINISHED_AT, &now.to_rfc3339())
            .await?;
        if !first {
            return Ok(());
        }

        if status.stop_requested {
            self.set_state(keys, SessionState::Stopped).await?;
            self.log(keys, LogLevel::Info, "Stopped after the last contact".to_string())
                .await?;
            return Ok(());
        }

        self.set_state(keys, SessionState::Completed).await?;
        let canceled = self.cancel_batches(session_id, keys).await?;
        self.log(
            keys,
            LogLevel::Info,
            format!(
                "Completed: {} sent, {} failed, {} skipped",
                status.success, status.failed, status.skipped
            ),
        )
        .await?;
        info!(
            session_id,
            success = status.success,
            failed = status.failed,
            skipped = status.skipped,
            leftover_batches = canceled,
            "Broadcast completed"
        );
        Ok(())
    }

    // ==================== State helpers ====================

    async fn load_status(&self, session_id: &str, keys: &SessionKeys) -> AppResult<Option<BroadcastStatus>> {
        let map = self.state.hash_get_all(&keys.status).await?;
        let stop_requested = self.state.get(&keys.stop).await?.is_some();
        Ok(BroadcastStatus::from_fields(session_id, &map, stop_requested))
    }

    /// Move the session to `state`. The ETA only exists while running.
    async fn set_state(&self, keys: &SessionKeys, state: SessionState) -> AppResult<()> {
        self.state
            .hash_set(&keys.status, &[(fields::STATE, state.as_str().to_string())])
            .await?;
        if state != SessionState::Running {
            self.state.hash_delete(&keys.status, fields::ETA).await?;
        }
        Ok(())
    }

    async fn publish_status(&self, session_id: &str, keys: &SessionKeys) -> AppResult<BroadcastStatus> {
        let status = self
            .load_status(session_id, keys)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Broadcast not found: {session_id}")))?;
        self.events
            .publish(&keys.events, &BroadcastEvent::Status(status.clone()))
            .await?;
        Ok(status)
    }

    async fn log(&self, keys: &SessionKeys, level: LogLevel, message: String) -> AppResult<()> {
        let entry = LogEntry {
            at: self.clock().now(),
            level,
            message,
        };
        self.state
            .push_bounded(&keys.logs, &serde_json::to_string(&entry)?, self.config.log_capacity)
            .await?;
        self.events.publish(&keys.events, &BroadcastEvent::Log(entry)).await?;
        Ok(())
    }

    /// Recompute the rate from recent durations and the ETA from the counters.
    async fn refresh_rate(&self, session_id: &str, keys: &SessionKeys) -> AppResult<()> {
        let Some(status) = self.load_status(session_id, keys).await? else {
            return Ok(());
        };
        let durations: Vec<u64> = self
            .state
            .range(&keys.durations)
            .await?
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect();

        let previous = (status.rate > 0.0).then_some(status.rate);
        let Some(rate) = self.estimator.update(previous, &durations) else {
            return Ok(());
        };

        let mut update = vec![(fields::RATE, rate.to_string())];
        let eta = if status.state == SessionState::Running {
            eta_seconds(status.remaining(), rate)
        } else {
            None
        };
        match eta {
            Some(eta) => update.push((fields::ETA, eta.to_string())),
            None => self.state.hash_delete(&keys.status, fields::ETA).await?,
        }
        self.state.hash_set(&keys.status, &update).await?;
        Ok(())
    }

    /// Record the batches of `[from, total)` and queue them.
    async fn enqueue_batches(
        &self,
        session_id: &str,
        keys: &SessionKeys,
        from: u64,
        total: u64,
    ) -> AppResult<usize> {
        let size = u64::try_from(self.config.batch_size).unwrap_or(u64::MAX);
        let batches = split_batches(from, total, size);

        // The batch map must exist before any batch can be claimed.
        self.state.delete(&keys.batches).await?;
        let entries: Vec<(String, String)> = batches
            .iter()
            .map(|(start, end)| (start.to_string(), end.to_string()))
            .collect();
        let pairs: Vec<(&str, String)> = entries
            .iter()
            .map(|(start, end)| (start.as_str(), end.clone()))
            .collect();
        if !pairs.is_empty() {
            self.state.hash_set(&keys.batches, &pairs).await?;
        }

        for &(start, end) in &batches {
            self.queue
                .enqueue(
                    TaskPayload::BroadcastBatch {
                        session_id: session_id.to_string(),
                        start,
                        end,
                    },
                    EnqueueOptions::default()
                        .dedupe(dedupe::broadcast_batch(session_id, start), DedupePolicy::KeepExisting),
                )
                .await?;
        }
        Ok(batches.len())
    }

    /// Cancel batches of the session that have not started.
    async fn cancel_batches(&self, session_id: &str, keys: &SessionKeys) -> AppResult<usize> {
        let batches: HashMap<String, String> = self.state.hash_get_all(&keys.batches).await?;
        let mut canceled = 0;
        for start in batches.keys() {
            let Ok(start) = start.parse::<u64>() else {
                continue;
            };
            match self
                .queue
                .cancel_by_dedupe_key(&dedupe::broadcast_batch(session_id, start))
                .await
            {
                Ok(true) => canceled += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id, start, error = %e, "Failed to cancel batch"),
            }
        }
        Ok(canceled)
    }
}
