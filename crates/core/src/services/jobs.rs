//! Routes claimed tasks to the service that owns them.

use std::sync::Arc;

use async_trait::async_trait;
use herald_queue::{TaskContext, TaskError, TaskHandler, TaskPayload};
use tracing::debug;

use super::broadcast::BroadcastDispatcher;
use super::offer::OfferService;
use super::reminder::ReminderService;
use super::sweep::ReachabilitySweep;

/// Task handler shared by every worker.
pub struct JobRouter {
    reminders: Arc<ReminderService>,
    offers: Arc<OfferService>,
    broadcasts: Arc<BroadcastDispatcher>,
    sweep: Arc<ReachabilitySweep>,
}

impl JobRouter {
    #[must_use]
    pub const fn new(
        reminders: Arc<ReminderService>,
        offers: Arc<OfferService>,
        broadcasts: Arc<BroadcastDispatcher>,
        sweep: Arc<ReachabilitySweep>,
    ) -> Self {
        Self {
            reminders,
            offers,
            broadcasts,
            sweep,
        }
    }
}

#[async_trait]
impl TaskHandler for JobRouter {
    async fn handle(&self, ctx: &TaskContext, payload: &TaskPayload) -> Result<(), TaskError> {
        debug!(task_id = %ctx.task_id, kind = payload.kind(), "Routing task");
        match payload {
            TaskPayload::Reminder { subscription_id } => {
                self.reminders.handle_reminder(ctx, subscription_id).await
            }
            TaskPayload::OfferExpiration { instance_id } => {
                self.offers.handle_expiration(ctx, instance_id).await
            }
            TaskPayload::BroadcastBatch {
                session_id,
                start,
                end,
            } => self.broadcasts.handle_batch(session_id, *start, *end).await,
            TaskPayload::ReachabilitySweep => {
                self.sweep.run().await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::offer::OfferCatalog;
    use crate::services::steps::StepCatalog;
    use crate::services::testing::{FakeGateway, ctx, manual_queue};
    use herald_common::config::{BroadcastConfig, SweepConfig};
    use herald_db::test_utils::MemoryStore;
    use herald_queue::MemoryStateStore;

    fn router() -> JobRouter {
        let (_clock, _backend, queue) = manual_queue();
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new();
        let reminders = Arc::new(ReminderService::new(
            store.clone(),
            store.clone(),
            gateway.clone(),
            queue.clone(),
            Arc::new(StepCatalog::new(Vec::new())),
            chrono_tz::UTC,
        ));
        let offers = Arc::new(OfferService::new(
            store.clone(),
            store.clone(),
            gateway.clone(),
            queue.clone(),
            Arc::new(OfferCatalog::new(Vec::new())),
        ));
        let broadcasts = Arc::new(BroadcastDispatcher::new(
            Arc::new(MemoryStateStore::new()),
            queue,
            gateway.clone(),
            store.clone(),
            BroadcastConfig::default(),
            "test",
        ));
        let sweep = Arc::new(ReachabilitySweep::new(
            store,
            reminders.clone(),
            gateway,
            SweepConfig::default(),
            broadcasts.pacer(),
        ));
        JobRouter::new(reminders, offers, broadcasts, sweep)
    }

    #[tokio::test]
    async fn test_unknown_targets_are_acknowledged() {
        let router = router();
        let payloads = [
            TaskPayload::Reminder {
                subscription_id: "missing".to_string(),
            },
            TaskPayload::OfferExpiration {
                instance_id: "missing".to_string(),
            },
            TaskPayload::BroadcastBatch {
                session_id: "missing".to_string(),
                start: 0,
                end: 10,
            },
            TaskPayload::ReachabilitySweep,
        ];
        for payload in &payloads {
            router.handle(&ctx("t1", 1, 3), payload).await.unwrap();
        }
    }
}
