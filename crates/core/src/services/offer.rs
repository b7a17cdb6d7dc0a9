//! Offer lifecycle manager.
//!
//! A subject sees each offer at most once: the first call to
//! [`OfferService::ensure_instance_started`] creates the instance and fixes its
//! expiry, later calls return it unchanged whatever its status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use herald_common::config::OfferDefinition;
use herald_common::{AppError, AppResult};
use herald_db::entities::offer_instance::{self, OfferStatus};
use herald_db::{MessageLocation, NewOfferInstance, OfferStore, SubjectStore};
use herald_queue::{DedupePolicy, EnqueueOptions, TaskContext, TaskError, TaskPayload, TaskQueue, dedupe};
use tracing::{debug, info, warn};

use super::delivery::DeliveryGateway;

/// Offers indexed by key.
#[derive(Debug, Clone, Default)]
pub struct OfferCatalog {
    offers: HashMap<String, OfferDefinition>,
}

impl OfferCatalog {
    #[must_use]
    pub fn new(offers: Vec<OfferDefinition>) -> Self {
        Self {
            offers: offers.into_iter().map(|o| (o.key.clone(), o)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OfferDefinition> {
        self.offers.get(key)
    }
}

/// Offer lifecycle service.
pub struct OfferService {
    offers: Arc<dyn OfferStore>,
    subjects: Arc<dyn SubjectStore>,
    gateway: Arc<dyn DeliveryGateway>,
    queue: Arc<TaskQueue>,
    catalog: Arc<OfferCatalog>,
}

impl OfferService {
    #[must_use]
    pub fn new(
        offers: Arc<dyn OfferStore>,
        subjects: Arc<dyn SubjectStore>,
        gateway: Arc<dyn DeliveryGateway>,
        queue: Arc<TaskQueue>,
        catalog: Arc<OfferCatalog>,
    ) -> Self {
        Self {
            offers,
            subjects,
            gateway,
            queue,
            catalog,
        }
    }

    /// Return the subject's instance of `offer_key`, creating it on first use.
    pub async fn ensure_instance_started(
        &self,
        subject_id: i64,
        offer_key: &str,
    ) -> AppResult<offer_instance::Model> {
        if let Some(existing) = self.offers.find_instance(subject_id, offer_key).await? {
            return Ok(existing);
        }

        let definition = self
            .catalog
            .get(offer_key)
            .ok_or_else(|| AppError::NotFound(format!("Offer not found: {offer_key}")))?;

        self.subjects.touch(subject_id).await?;
        let now = self.queue.clock().now();
        let input = NewOfferInstance {
            subject_id,
            offer_key: offer_key.to_string(),
            created_at: now,
            expires_at: definition
                .lifetime_minutes
                .map(|minutes| now + Duration::minutes(minutes)),
            initial_price: definition.price,
            currency: definition.currency.clone(),
        };

        match self.offers.create_instance(input).await {
            Ok(instance) => {
                info!(
                    subject_id,
                    offer = offer_key,
                    instance_id = %instance.id,
                    expires_at = ?instance.expires_at,
                    "Offer instance started"
                );
                Ok(instance)
            }
            // Lost a race with a concurrent start; the winner's row is the instance.
            Err(AppError::Conflict(_)) => self
                .offers
                .find_instance(subject_id, offer_key)
                .await?
                .ok_or_else(|| AppError::Internal(format!("Offer instance vanished: {subject_id}/{offer_key}"))),
            Err(e) => Err(e),
        }
    }

    /// Arm the expiration of an instance that was just (re)displayed at `location`.
    ///
    /// Returns the id of the armed task, or `None` when nothing was armed.
    pub async fn arm_expiration(
        &self,
        instance: &offer_instance::Model,
        location: Option<MessageLocation>,
    ) -> AppResult<Option<String>> {
        let Some(expires_at) = instance.expires_at else {
            return Ok(None);
        };
        if instance.status != OfferStatus::Active {
            debug!(instance_id = %instance.id, status = ?instance.status, "Offer not active, not arming");
            return Ok(None);
        }

        let delay = expires_at.to_utc() - self.queue.clock().now();
        if delay <= Duration::zero() {
            debug!(instance_id = %instance.id, "Offer already past expiry, not arming");
            return Ok(None);
        }

        if let Some(previous) = &instance.last_expiration_task_id {
            match self.queue.cancel(previous).await {
                Ok(removed) => debug!(instance_id = %instance.id, task_id = %previous, removed, "Previous expiration task cancel"),
                Err(e) => warn!(instance_id = %instance.id, task_id = %previous, error = %e, "Failed to cancel previous expiration task"),
            }
        }

        let task_id = self
            .queue
            .enqueue(
                TaskPayload::OfferExpiration {
                    instance_id: instance.id.clone(),
                },
                EnqueueOptions::default()
                    .delay(delay)
                    .dedupe(dedupe::offer_expiration(&instance.id), DedupePolicy::Replace),
            )
            .await?;

        self.offers
            .record_display(
                &instance.id,
                location.or_else(|| instance.last_location()),
                Some(task_id.clone()),
            )
            .await?;
        debug!(instance_id = %instance.id, task_id = %task_id, %expires_at, "Offer expiration armed");
        Ok(Some(task_id))
    }

    /// Expire an instance whose timer fired.
    pub async fn handle_expiration(&self, ctx: &TaskContext, instance_id: &str) -> Result<(), TaskError> {
        let Some(instance) = self.offers.find_instance_by_id(instance_id).await? else {
            debug!(instance_id, "Offer instance missing, nothing to expire");
            return Ok(());
        };

        if instance.status.is_resolved() {
            debug!(instance_id, status = ?instance.status, "Offer already resolved, forgetting task");
            self.offers.clear_expiration_task(instance_id).await?;
            return Ok(());
        }

        let Some(expires_at) = instance.expires_at else {
            return Ok(());
        };

        // Scaled clocks fire armed tasks before `expires_at`; only a task that is
        // not the armed one is stale.
        let now = self.queue.clock().now();
        let is_armed = instance.last_expiration_task_id.as_deref() == Some(ctx.task_id.as_str());
        if expires_at.to_utc() > now && !is_armed {
            debug!(instance_id, %expires_at, "Stale expiration delivery, offer still running");
            return Ok(());
        }

        if let Some(location) = instance.last_location() {
            if let Err(e) = self.gateway.delete_message(location).await {
                warn!(instance_id, chat_id = location.chat_id, message_id = location.message_id, error = %e, "Failed to delete expired offer message");
            }
        }

        if instance.status == OfferStatus::Active {
            let expired = self
                .offers
                .transition_instance(instance_id, OfferStatus::Active, OfferStatus::Expired, now)
                .await?;
            if expired {
                info!(instance_id, subject_id = instance.subject_id, offer = %instance.offer_key, "Offer expired");
            }
        }

        self.offers.clear_expiration_task(instance_id).await?;
        Ok(())
    }

    /// Record a payment for the subject's instance of `offer_key`.
    pub async fn confirm_payment(
        &self,
        subject_id: i64,
        offer_key: &str,
    ) -> AppResult<offer_instance::Model> {
        let instance = self
            .offers
            .find_instance(subject_id, offer_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Offer instance not found: {subject_id}/{offer_key}")))?;

        let now = self.queue.clock().now();
        let paid = self.offers.force_paid(&instance.id, now).await?;

        if let Some(task_id) = &instance.last_expiration_task_id {
            if let Err(e) = self.queue.cancel(task_id).await {
                warn!(instance_id = %instance.id, task_id = %task_id, error = %e, "Failed to cancel expiration task");
            }
            self.offers.clear_expiration_task(&instance.id).await?;
        }

        self.subjects.mark_converted(subject_id).await?;
        info!(subject_id, offer = offer_key, instance_id = %instance.id, paid, "Payment confirmed");

        self.offers
            .find_instance_by_id(&instance.id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Offer instance vanished: {}", instance.id)))
    }
}
