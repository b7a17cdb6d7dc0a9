//! Persistence gateway traits.
//!
//! Core services talk to storage only through these traits. The sea-orm
//! repositories implement them for production; [`crate::test_utils`] provides
//! an in-memory implementation.
//!
//! Every state transition is guarded by the expected current status so that
//! re-delivered tasks and concurrent handlers cannot overwrite each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::AppResult;
use serde::{Deserialize, Serialize};

use crate::entities::offer_instance::{self, OfferStatus};
use crate::entities::reminder_subscription::{self, ReminderStatus};
use crate::entities::subject;

/// Where a message was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageLocation {
    /// Chat id.
    pub chat_id: i64,
    /// Message id inside the chat.
    pub message_id: i32,
}

impl offer_instance::Model {
    /// Location of the last displayed offer message, if any.
    #[must_use]
    pub const fn last_location(&self) -> Option<MessageLocation> {
        match (self.message_chat_id, self.message_id) {
            (Some(chat_id), Some(message_id)) => Some(MessageLocation {
                chat_id,
                message_id,
            }),
            _ => None,
        }
    }
}

/// Input for a new reminder subscription.
#[derive(Debug, Clone)]
pub struct NewReminderSubscription {
    pub subject_id: i64,
    pub step_id: String,
    pub scenario_key: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Input for a new offer instance.
#[derive(Debug, Clone)]
pub struct NewOfferInstance {
    pub subject_id: i64,
    pub offer_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_price: i64,
    pub currency: String,
}

/// Storage of reminder subscriptions.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// Insert a new `Pending` subscription.
    async fn create_subscription(
        &self,
        input: NewReminderSubscription,
    ) -> AppResult<reminder_subscription::Model>;

    /// Find a subscription by id.
    async fn find_subscription(&self, id: &str) -> AppResult<Option<reminder_subscription::Model>>;

    /// Record the queue task that delivers the subscription.
    async fn attach_task(&self, id: &str, task_id: &str) -> AppResult<()>;

    /// Move `from` to `to`. Returns `false` if the row was not in `from`.
    async fn transition_subscription(
        &self,
        id: &str,
        from: ReminderStatus,
        to: ReminderStatus,
    ) -> AppResult<bool>;

    /// All `Pending` subscriptions of a subject.
    async fn find_pending_by_subject(
        &self,
        subject_id: i64,
    ) -> AppResult<Vec<reminder_subscription::Model>>;
}

/// Storage of offer instances.
#[async_trait]
pub trait OfferStore: Send + Sync {
    /// Find the instance of an offer for a subject, whatever its status.
    async fn find_instance(
        &self,
        subject_id: i64,
        offer_key: &str,
    ) -> AppResult<Option<offer_instance::Model>>;

    /// Find an instance by id.
    async fn find_instance_by_id(&self, id: &str) -> AppResult<Option<offer_instance::Model>>;

    /// Insert a new `Active` instance.
    ///
    /// Fails with [`herald_common::AppError::Conflict`] if the subject already
    /// has an instance of this offer.
    async fn create_instance(&self, input: NewOfferInstance) -> AppResult<offer_instance::Model>;

    /// Record the last displayed message and the expiration task armed for it.
    async fn record_display(
        &self,
        id: &str,
        location: Option<MessageLocation>,
        task_id: Option<String>,
    ) -> AppResult<()>;

    /// Forget the stored expiration task.
    async fn clear_expiration_task(&self, id: &str) -> AppResult<()>;

    /// Move `from` to `to`, stamping `finished_at`. Returns `false` if the row
    /// was not in `from`.
    async fn transition_instance(
        &self,
        id: &str,
        from: OfferStatus,
        to: OfferStatus,
        finished_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Force the instance to `Paid` from any other status.
    async fn force_paid(&self, id: &str, paid_at: DateTime<Utc>) -> AppResult<bool>;
}

/// Storage of subject flags.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Find a subject. Unknown subjects are reachable and unconverted.
    async fn find_subject(&self, id: i64) -> AppResult<Option<subject::Model>>;

    /// Make sure a row exists for the subject, leaving existing flags alone.
    async fn touch(&self, id: i64) -> AppResult<()>;

    /// Flag the subject as permanently unreachable.
    async fn mark_unreachable(&self, id: i64, reason: &str) -> AppResult<()>;

    /// Flag the subject as converted.
    async fn mark_converted(&self, id: i64) -> AppResult<()>;

    /// Record group membership observed by the sweep.
    async fn record_membership(&self, id: i64, is_member: bool) -> AppResult<()>;

    /// Reachable subjects with `id > after`, ascending.
    async fn list_reachable(&self, after: Option<i64>, limit: u64)
    -> AppResult<Vec<subject::Model>>;
}

/// Whether a subject may receive messages, treating unknown subjects as reachable.
#[must_use]
pub fn is_reachable(subject: Option<&subject::Model>) -> bool {
    subject.is_none_or(|s| s.is_reachable)
}

/// Whether a subject already converted, treating unknown subjects as not converted.
#[must_use]
pub fn has_converted(subject: Option<&subject::Model>) -> bool {
    subject.is_some_and(subject::Model::has_converted)
}
