//! In-memory implementation of the persistence gateways.
//!
//! Used by service tests and by local runs without a database. Status
//! transitions follow the same compare-and-set rules as the repositories.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{AppError, AppResult, IdGenerator};

use crate::entities::offer_instance::{self, OfferStatus};
use crate::entities::reminder_subscription::{self, ReminderStatus};
use crate::entities::subject;
use crate::gateway::{
    MessageLocation, NewOfferInstance, NewReminderSubscription, OfferStore, ReminderStore,
    SubjectStore,
};

#[derive(Default)]
struct State {
    subscriptions: HashMap<String, reminder_subscription::Model>,
    offers: HashMap<String, offer_instance::Model>,
    subjects: BTreeMap<i64, subject::Model>,
    failing: HashSet<String>,
}

/// In-memory store implementing [`ReminderStore`], [`OfferStore`] and [`SubjectStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    id_gen: IdGenerator,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every write touching `id` fail with a database error.
    pub fn fail_writes_for(&self, id: &str) {
        self.lock().failing.insert(id.to_string());
    }

    /// All subscriptions of a subject, earliest due first.
    #[must_use]
    pub fn subscriptions_of(&self, subject_id: i64) -> Vec<reminder_subscription::Model> {
        let mut subs: Vec<_> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.subject_id == subject_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        subs
    }

    fn check_writable(state: &State, id: &str) -> AppResult<()> {
        if state.failing.contains(id) {
            return Err(AppError::Database(format!("Injected failure for {id}")));
        }
        Ok(())
    }
}

fn blank_subject(id: i64) -> subject::Model {
    subject::Model {
        id,
        is_reachable: true,
        unreachable_reason: None,
        unreachable_at: None,
        converted_at: None,
        is_member: None,
        checked_at: None,
        created_at: Utc::now().into(),
        updated_at: None,
    }
}

#[async_trait]
impl ReminderStore for MemoryStore {
    async fn create_subscription(
        &self,
        input: NewReminderSubscription,
    ) -> AppResult<reminder_subscription::Model> {
        let model = reminder_subscription::Model {
            id: self.id_gen.generate(),
            subject_id: input.subject_id,
            step_id: input.step_id,
            scenario_key: input.scenario_key,
            status: ReminderStatus::Pending,
            scheduled_at: input.scheduled_at.into(),
            task_id: None,
            created_at: Utc::now().into(),
            updated_at: None,
        };
        self.lock()
            .subscriptions
            .insert(model.id.clone(), model.clone());
        Ok(model)
    }

    async fn find_subscription(&self, id: &str) -> AppResult<Option<reminder_subscription::Model>> {
        Ok(self.lock().subscriptions.get(id).cloned())
    }

    async fn attach_task(&self, id: &str, task_id: &str) -> AppResult<()> {
        let mut state = self.lock();
        Self::check_writable(&state, id)?;
        if let Some(sub) = state.subscriptions.get_mut(id) {
            sub.task_id = Some(task_id.to_string());
        }
        Ok(())
    }

    async fn transition_subscription(
        &self,
        id: &str,
        from: ReminderStatus,
        to: ReminderStatus,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        Self::check_writable(&state, id)?;
        match state.subscriptions.get_mut(id) {
            Some(sub) if sub.status == from => {
                sub.status = to;
                sub.updated_at = Some(Utc::now().into());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_pending_by_subject(
        &self,
        subject_id: i64,
    ) -> AppResult<Vec<reminder_subscription::Model>> {
        let mut pending: Vec<_> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.subject_id == subject_id && s.status == ReminderStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        Ok(pending)
    }
}

#[async_trait]
impl OfferStore for MemoryStore {
    async fn find_instance(
        &self,
        subject_id: i64,
        offer_key: &str,
    ) -> AppResult<Option<offer_instance::Model>> {
        Ok(self
            .lock()
            .offers
            .values()
            .find(|o| o.subject_id == subject_id && o.offer_key == offer_key)
            .cloned())
    }

    async fn find_instance_by_id(&self, id: &str) -> AppResult<Option<offer_instance::Model>> {
        Ok(self.lock().offers.get(id).cloned())
    }

    async fn create_instance(&self, input: NewOfferInstance) -> AppResult<offer_instance::Model> {
        let mut state = self.lock();
        let exists = state
            .offers
            .values()
            .any(|o| o.subject_id == input.subject_id && o.offer_key == input.offer_key);
        if exists {
            return Err(AppError::Conflict(format!(
                "Offer instance already exists: {}/{}",
                input.subject_id, input.offer_key
            )));
        }

        let model = offer_instance::Model {
            id: self.id_gen.generate(),
            subject_id: input.subject_id,
            offer_key: input.offer_key,
            status: OfferStatus::Active,
            created_at: input.created_at.into(),
            expires_at: input.expires_at.map(Into::into),
            finished_at: None,
            initial_price: input.initial_price,
            currency: input.currency,
            message_chat_id: None,
            message_id: None,
            last_expiration_task_id: None,
            updated_at: None,
        };
        state.offers.insert(model.id.clone(), model.clone());
        Ok(model)
    }

    async fn record_display(
        &self,
        id: &str,
        location: Option<MessageLocation>,
        task_id: Option<String>,
    ) -> AppResult<()> {
        let mut state = self.lock();
        Self::check_writable(&state, id)?;
        if let Some(offer) = state.offers.get_mut(id) {
            offer.message_chat_id = location.map(|l| l.chat_id);
            offer.message_id = location.map(|l| l.message_id);
            offer.last_expiration_task_id = task_id;
        }
        Ok(())
    }

    async fn clear_expiration_task(&self, id: &str) -> AppResult<()> {
        if let Some(offer) = self.lock().offers.get_mut(id) {
            offer.last_expiration_task_id = None;
        }
        Ok(())
    }

    async fn transition_instance(
        &self,
        id: &str,
        from: OfferStatus,
        to: OfferStatus,
        finished_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        Self::check_writable(&state, id)?;
        match state.offers.get_mut(id) {
            Some(offer) if offer.status == from => {
                offer.status = to;
                offer.finished_at = Some(finished_at.into());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_paid(&self, id: &str, paid_at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.lock();
        Self::check_writable(&state, id)?;
        match state.offers.get_mut(id) {
            Some(offer) if offer.status != OfferStatus::Paid => {
                offer.status = OfferStatus::Paid;
                offer.finished_at = Some(paid_at.into());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn find_subject(&self, id: i64) -> AppResult<Option<subject::Model>> {
        Ok(self.lock().subjects.get(&id).cloned())
    }

    async fn touch(&self, id: i64) -> AppResult<()> {
        self.lock().subjects.entry(id).or_insert_with(|| blank_subject(id));
        Ok(())
    }

    async fn mark_unreachable(&self, id: i64, reason: &str) -> AppResult<()> {
        let mut state = self.lock();
        let subject = state.subjects.entry(id).or_insert_with(|| blank_subject(id));
        subject.is_reachable = false;
        subject.unreachable_reason = Some(reason.to_string());
        subject.unreachable_at = Some(Utc::now().into());
        Ok(())
    }

    async fn mark_converted(&self, id: i64) -> AppResult<()> {
        let mut state = self.lock();
        let subject = state.subjects.entry(id).or_insert_with(|| blank_subject(id));
        subject.converted_at = Some(Utc::now().into());
        Ok(())
    }

    async fn record_membership(&self, id: i64, is_member: bool) -> AppResult<()> {
        let mut state = self.lock();
        let subject = state.subjects.entry(id).or_insert_with(|| blank_subject(id));
        subject.is_member = Some(is_member);
        subject.checked_at = Some(Utc::now().into());
        Ok(())
    }

    async fn list_reachable(
        &self,
        after: Option<i64>,
        limit: u64,
    ) -> AppResult<Vec<subject::Model>> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .lock()
            .subjects
            .values()
            .filter(|s| s.is_reachable && after.is_none_or(|after| s.id > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_offer(subject_id: i64) -> NewOfferInstance {
        NewOfferInstance {
            subject_id,
            offer_key: "trial".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            initial_price: 100,
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_offer_instance_conflicts() {
        let store = MemoryStore::new();
        store.create_instance(new_offer(1)).await.unwrap();

        let err = store.create_instance(new_offer(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        store.create_instance(new_offer(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = MemoryStore::new();
        let offer = store.create_instance(new_offer(1)).await.unwrap();
        let now = Utc::now();

        assert!(
            store
                .transition_instance(&offer.id, OfferStatus::Active, OfferStatus::Expired, now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition_instance(&offer.id, OfferStatus::Active, OfferStatus::Canceled, now)
                .await
                .unwrap()
        );
        assert!(store.force_paid(&offer.id, now).await.unwrap());
        assert!(!store.force_paid(&offer.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_keeps_existing_flags() {
        let store = MemoryStore::new();
        store.touch(1).await.unwrap();
        assert!(store.find_subject(1).await.unwrap().unwrap().is_reachable);

        store.mark_unreachable(1, "blocked").await.unwrap();
        store.touch(1).await.unwrap();
        assert!(!store.find_subject(1).await.unwrap().unwrap().is_reachable);
    }

    #[tokio::test]
    async fn test_list_reachable_pages() {
        let store = MemoryStore::new();
        for id in 1..=5 {
            store.touch(id).await.unwrap();
        }
        store.mark_unreachable(3, "blocked").await.unwrap();

        let first = store.list_reachable(None, 2).await.unwrap();
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = store.list_reachable(Some(2), 2).await.unwrap();
        assert_eq!(second.iter().map(|s| s.id).collect::<Vec<_>>(), vec![4, 5]);
    }
}
