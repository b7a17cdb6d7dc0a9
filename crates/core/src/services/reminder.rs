//! Reminder chain scheduler.
//!
//! Entering a step plans its reminders with [`compute_chain`], persists one
//! `Pending` subscription per reminder and enqueues a delivery task for each.
//! Delivering a reminder schedules the chain of the delivered step, so chains
//! extend themselves as far as the step catalog goes.

use std::sync::Arc;

use chrono_tz::Tz;
use herald_common::AppResult;
use herald_db::entities::reminder_subscription::{self, ReminderStatus};
use herald_db::gateway::{has_converted, is_reachable};
use herald_db::{NewReminderSubscription, ReminderStore, SubjectStore};
use herald_queue::{DedupePolicy, EnqueueOptions, TaskContext, TaskError, TaskPayload, TaskQueue, dedupe};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::delivery::{DeliveryError, DeliveryGateway};
use super::steps::{StepCatalog, compute_chain};

/// Result of cancelling a subject's pending reminders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSummary {
    pub canceled: usize,
    /// Subscriptions that could not be cancelled and stay pending.
    pub failed: usize,
}

/// Reminder chain scheduler and delivery handler.
pub struct ReminderService {
    reminders: Arc<dyn ReminderStore>,
    subjects: Arc<dyn SubjectStore>,
    gateway: Arc<dyn DeliveryGateway>,
    queue: Arc<TaskQueue>,
    catalog: Arc<StepCatalog>,
    timezone: Tz,
}

impl ReminderService {
    #[must_use]
    pub fn new(
        reminders: Arc<dyn ReminderStore>,
        subjects: Arc<dyn SubjectStore>,
        gateway: Arc<dyn DeliveryGateway>,
        queue: Arc<TaskQueue>,
        catalog: Arc<StepCatalog>,
        timezone: Tz,
    ) -> Self {
        Self {
            reminders,
            subjects,
            gateway,
            queue,
            catalog,
            timezone,
        }
    }

    /// Schedule the reminders of `step_id` for a subject.
    ///
    /// Returns the created subscriptions in chain order.
    pub async fn schedule_chain(
        &self,
        subject_id: i64,
        step_id: &str,
        scenario_key: &str,
    ) -> AppResult<Vec<reminder_subscription::Model>> {
        let now = self.queue.clock().now();
        let plan = compute_chain(&self.catalog, step_id, now, self.timezone)?;
        self.subjects.touch(subject_id).await?;

        let mut created = Vec::with_capacity(plan.len());
        for planned in plan {
            let mut subscription = self
                .reminders
                .create_subscription(NewReminderSubscription {
                    subject_id,
                    step_id: planned.step_id,
                    scenario_key: scenario_key.to_string(),
                    scheduled_at: planned.scheduled_at,
                })
                .await?;

            let task_id = self
                .queue
                .enqueue(
                    TaskPayload::Reminder {
                        subscription_id: subscription.id.clone(),
                    },
                    EnqueueOptions::default()
                        .delay(planned.scheduled_at - now)
                        .dedupe(dedupe::reminder(&subscription.id), DedupePolicy::KeepExisting),
                )
                .await?;
            self.reminders.attach_task(&subscription.id, &task_id).await?;

            debug!(
                subject_id,
                subscription_id = %subscription.id,
                step = %subscription.step_id,
                scheduled_at = %planned.scheduled_at,
                task_id = %task_id,
                "Reminder scheduled"
            );
            subscription.task_id = Some(task_id);
            created.push(subscription);
        }

        if !created.is_empty() {
            info!(subject_id, step = step_id, count = created.len(), "Reminder chain scheduled");
        }
        Ok(created)
    }

    /// Deliver a reminder.
    ///
    /// Safe to run more than once for the same subscription: anything but a
    /// `Pending` subscription is left alone.
    pub async fn handle_reminder(
        &self,
        ctx: &TaskContext,
        subscription_id: &str,
    ) -> Result<(), TaskError> {
        let Some(subscription) = self.reminders.find_subscription(subscription_id).await? else {
            debug!(subscription_id, "Reminder subscription missing, nothing to deliver");
            return Ok(());
        };
        if subscription.status != ReminderStatus::Pending {
            debug!(subscription_id, status = ?subscription.status, "Reminder already resolved");
            return Ok(());
        }

        let subject_id = subscription.subject_id;
        let subject = self.subjects.find_subject(subject_id).await?;
        if !is_reachable(subject.as_ref()) || has_converted(subject.as_ref()) {
            self.skip(&subscription, "subject unreachable or converted").await?;
            return Ok(());
        }

        let Some(step) = self.catalog.get(&subscription.step_id) else {
            warn!(subscription_id, step = %subscription.step_id, "Reminder step no longer exists");
            self.skip(&subscription, "unknown step").await?;
            return Ok(());
        };

        match self.gateway.send_message(subject_id, &step.text).await {
            Ok(_) => {
                let sent = self
                    .reminders
                    .transition_subscription(subscription_id, ReminderStatus::Pending, ReminderStatus::Sent)
                    .await?;
                if !sent {
                    debug!(subscription_id, "Reminder resolved concurrently, not extending chain");
                    return Ok(());
                }
                info!(subject_id, subscription_id, step = %step.id, "Reminder sent");
                self.schedule_chain(subject_id, &step.id, &subscription.scenario_key)
                    .await?;
                Ok(())
            }
            Err(DeliveryError::Permanent(reason)) => {
                warn!(subject_id, subscription_id, reason = %reason, "Subject unreachable, cancelling chain");
                self.subjects.mark_unreachable(subject_id, &reason).await?;
                self.cancel_all_pending(subject_id).await?;
                Ok(())
            }
            Err(DeliveryError::Rejected(reason)) => {
                warn!(subject_id, subscription_id, reason = %reason, "Reminder rejected by provider");
                self.skip(&subscription, "rejected by provider").await?;
                Ok(())
            }
            Err(error) if ctx.is_final_attempt() => {
                warn!(subject_id, subscription_id, error = %error, "Reminder delivery gave up");
                self.skip(&subscription, "delivery attempts exhausted").await?;
                Ok(())
            }
            Err(error) => Err(TaskError::Retryable(error.to_string())),
        }
    }

    /// Cancel every pending reminder of a subject.
    ///
    /// A failure on one subscription is logged and the sweep continues.
    pub async fn cancel_all_pending(&self, subject_id: i64) -> AppResult<CancelSummary> {
        let pending = self.reminders.find_pending_by_subject(subject_id).await?;
        let mut summary = CancelSummary::default();

        for subscription in pending {
            if let Some(task_id) = &subscription.task_id {
                match self.queue.cancel(task_id).await {
                    Ok(removed) => {
                        debug!(subscription_id = %subscription.id, task_id = %task_id, removed, "Reminder task cancel");
                    }
                    Err(e) => {
                        warn!(subscription_id = %subscription.id, task_id = %task_id, error = %e, "Failed to remove reminder task");
                    }
                }
            }

            match self
                .reminders
                .transition_subscription(&subscription.id, ReminderStatus::Pending, ReminderStatus::Canceled)
                .await
            {
                Ok(true) => summary.canceled += 1,
                Ok(false) => {
                    debug!(subscription_id = %subscription.id, "Reminder resolved before cancellation");
                }
                Err(e) => {
                    warn!(subscription_id = %subscription.id, error = %e, "Failed to cancel reminder");
                    summary.failed += 1;
                }
            }
        }

        info!(
            subject_id,
            canceled = summary.canceled,
            failed = summary.failed,
            "Pending reminders cancelled"
        );
        Ok(summary)
    }

    async fn skip(&self, subscription: &reminder_subscription::Model, why: &str) -> AppResult<()> {
        let skipped = self
            .reminders
            .transition_subscription(&subscription.id, ReminderStatus::Pending, ReminderStatus::Skipped)
            .await?;
        debug!(subscription_id = %subscription.id, skipped, why, "Reminder skipped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::delivery::classify_provider_error;
    use crate::services::testing::{FakeGateway, ctx, manual_queue};
    use chrono::{Duration, TimeZone, Utc};
    use herald_common::config::{ReminderBinding, StepDefinition};
    use herald_common::{Clock, ManualClock, TimeOfDay};
    use herald_db::test_utils::MemoryStore;
    use herald_queue::{MemoryBackend, TaskHandler, queues};

    struct Fixture {
        clock: Arc<ManualClock>,
        backend: Arc<MemoryBackend>,
        queue: Arc<TaskQueue>,
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        service: Arc<ReminderService>,
    }

    /// Delivers reminder tasks through the service under test.
    struct Handler(Arc<ReminderService>);

    #[async_trait::async_trait]
    impl TaskHandler for Handler {
        async fn handle(&self, ctx: &TaskContext, payload: &TaskPayload) -> Result<(), TaskError> {
            match payload {
                TaskPayload::Reminder { subscription_id } => {
                    self.0.handle_reminder(ctx, subscription_id).await
                }
                other => Err(TaskError::Terminal(format!("unexpected {}", other.kind()))),
            }
        }
    }

    fn step(id: &str, reminders: Vec<(&str, i64)>, at: Option<TimeOfDay>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            default_delay_minutes: None,
            time_of_day: at,
            text: format!("text of {id}"),
            reminders: reminders
                .into_iter()
                .map(|(step, delay)| ReminderBinding {
                    step: step.to_string(),
                    delay_minutes: Some(delay),
                })
                .collect(),
        }
    }

    fn fixture() -> Fixture {
        let (clock, backend, queue) = manual_queue();
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new();
        let catalog = StepCatalog::new(vec![
            step("welcome", vec![("nudge", 120), ("morning", 1320)], None),
            step("nudge", vec![], None),
            step("morning", vec![("last", 60)], TimeOfDay::new(9, 0)),
            step("last", vec![], None),
        ]);
        let service = Arc::new(ReminderService::new(
            store.clone(),
            store.clone(),
            gateway.clone(),
            queue.clone(),
            Arc::new(catalog),
            Tz::UTC,
        ));
        Fixture {
            clock,
            backend,
            queue,
            store,
            gateway,
            service,
        }
    }

    #[tokio::test]
    async fn test_schedule_chain_persists_and_enqueues() {
        let f = fixture();
        let start = f.clock.now();

        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].scheduled_at, start + Duration::minutes(120));
        // 14:00 + 22h = 12:00 next day, past 09:00, so 09:00 the day after.
        assert_eq!(
            subs[1].scheduled_at,
            Utc.with_ymd_and_hms(2025, 5, 12, 9, 0, 0).unwrap()
        );

        for sub in &subs {
            let task = f.queue.get(sub.task_id.as_deref().unwrap()).await.unwrap().unwrap();
            assert_eq!(task.not_before, sub.scheduled_at);
            assert_eq!(task.dedupe_key, Some(format!("reminder:{}", sub.id)));
        }
        assert_eq!(f.store.subscriptions_of(1).len(), 2);
        assert!(f.store.find_subject(1).await.unwrap().unwrap().is_reachable);
    }

    #[tokio::test]
    async fn test_delivery_marks_sent_and_extends_chain() {
        let f = fixture();
        let handler = Handler(f.service.clone());
        f.service.schedule_chain(1, "welcome", "main").await.unwrap();

        f.clock.set(Utc.with_ymd_and_hms(2025, 5, 12, 9, 0, 0).unwrap());
        assert_eq!(f.queue.run_due(queues::REMINDERS, &handler).await.unwrap(), 2);

        assert_eq!(f.gateway.sent_to(), vec![1, 1]);
        let subs = f.store.subscriptions_of(1);
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].status, ReminderStatus::Sent);
        assert_eq!(subs[1].status, ReminderStatus::Sent);
        // "morning" carries its own reminder, offset from delivery time.
        assert_eq!(subs[2].step_id, "last");
        assert_eq!(subs[2].status, ReminderStatus::Pending);
        assert_eq!(
            subs[2].scheduled_at,
            Utc.with_ymd_and_hms(2025, 5, 12, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_noop() {
        let f = fixture();
        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();

        f.service.handle_reminder(&ctx("t", 1, 5), &subs[0].id).await.unwrap();
        f.service.handle_reminder(&ctx("t", 2, 5), &subs[0].id).await.unwrap();

        assert_eq!(f.gateway.sent().len(), 1);
        assert_eq!(f.store.subscriptions_of(1).len(), 2);
    }

    #[tokio::test]
    async fn test_converted_subject_is_skipped() {
        let f = fixture();
        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();
        f.store.mark_converted(1).await.unwrap();

        f.service.handle_reminder(&ctx("t", 1, 5), &subs[0].id).await.unwrap();

        assert!(f.gateway.sent().is_empty());
        let sub = f.store.find_subscription(&subs[0].id).await.unwrap().unwrap();
        assert_eq!(sub.status, ReminderStatus::Skipped);
    }

    #[tokio::test]
    async fn test_permanent_failure_cancels_whole_chain() {
        let f = fixture();
        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();
        f.gateway
            .fail_next(1, DeliveryError::Permanent("bot was blocked by the user".into()));

        f.service.handle_reminder(&ctx("t", 1, 5), &subs[0].id).await.unwrap();

        let subject = f.store.find_subject(1).await.unwrap().unwrap();
        assert!(!subject.is_reachable);
        for sub in f.store.subscriptions_of(1) {
            assert_eq!(sub.status, ReminderStatus::Canceled);
        }
        // The second reminder's task is gone from the queue.
        assert!(f.queue.get(subs[1].task_id.as_deref().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_request_skips_without_flagging_subject() {
        let f = fixture();
        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();
        f.gateway.fail_next(
            1,
            classify_provider_error(400, "Bad Request: can't parse entities"),
        );

        f.service.handle_reminder(&ctx("t", 1, 5), &subs[0].id).await.unwrap();

        let subject = f.store.find_subject(1).await.unwrap().unwrap();
        assert!(subject.is_reachable);
        let subs = f.store.subscriptions_of(1);
        assert_eq!(subs[0].status, ReminderStatus::Skipped);
        assert_eq!(subs[1].status, ReminderStatus::Pending);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_skips() {
        let f = fixture();
        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();
        f.gateway.fail_next(1, DeliveryError::Transient("timeout".into()));
        f.gateway.fail_next(1, DeliveryError::Transient("timeout".into()));

        let first = f.service.handle_reminder(&ctx("t", 1, 2), &subs[0].id).await;
        assert!(matches!(first, Err(TaskError::Retryable(_))));

        f.service.handle_reminder(&ctx("t", 2, 2), &subs[0].id).await.unwrap();
        let sub = f.store.find_subscription(&subs[0].id).await.unwrap().unwrap();
        assert_eq!(sub.status, ReminderStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_tolerates_partial_failure() {
        let f = fixture();
        let subs = f.service.schedule_chain(1, "welcome", "main").await.unwrap();

        // First task already delivered and gone, second row refuses writes.
        f.queue.cancel(subs[0].task_id.as_deref().unwrap()).await.unwrap();
        f.store.fail_writes_for(&subs[1].id);

        let summary = f.service.cancel_all_pending(1).await.unwrap();
        assert_eq!(summary, CancelSummary { canceled: 1, failed: 1 });
        assert!(f.backend.tasks().await.is_empty());
    }
}
