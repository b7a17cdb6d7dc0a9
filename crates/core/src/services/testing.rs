//! Test doubles shared by the service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use herald_common::{ManualClock, SharedClock};
use herald_db::MessageLocation;
use herald_queue::{MemoryBackend, RetryConfig, TaskContext, TaskQueue};

use super::delivery::{DeliveryError, DeliveryGateway, MediaItem, MemberStatus, MessageRef};

/// Gateway that records calls and replays scripted failures.
#[derive(Default)]
pub struct FakeGateway {
    sent: Mutex<Vec<(i64, String)>>,
    deleted: Mutex<Vec<MessageLocation>>,
    failures: Mutex<HashMap<i64, VecDeque<DeliveryError>>>,
    members: Mutex<HashMap<i64, MemberStatus>>,
    fail_deletes: AtomicBool,
    next_message_id: AtomicI32,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next call addressed to `contact_id` with `error`.
    pub fn fail_next(&self, contact_id: i64, error: DeliveryError) {
        self.failures
            .lock()
            .unwrap()
            .entry(contact_id)
            .or_default()
            .push_back(error);
    }

    pub fn set_member(&self, contact_id: i64, status: MemberStatus) {
        self.members.lock().unwrap().insert(contact_id, status);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Successful sends in order.
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self) -> Vec<i64> {
        self.sent().into_iter().map(|(contact, _)| contact).collect()
    }

    pub fn deleted(&self) -> Vec<MessageLocation> {
        self.deleted.lock().unwrap().clone()
    }

    fn scripted(&self, contact_id: i64) -> Option<DeliveryError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(&contact_id)
            .and_then(VecDeque::pop_front)
    }

    fn record(&self, contact_id: i64, text: &str) -> MessageRef {
        self.sent.lock().unwrap().push((contact_id, text.to_string()));
        MessageRef {
            chat_id: contact_id,
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }
}

#[async_trait]
impl DeliveryGateway for FakeGateway {
    async fn send_message(&self, contact_id: i64, html: &str) -> Result<MessageRef, DeliveryError> {
        if let Some(error) = self.scripted(contact_id) {
            return Err(error);
        }
        Ok(self.record(contact_id, html))
    }

    async fn send_media(
        &self,
        contact_id: i64,
        items: &[MediaItem],
        caption: Option<&str>,
    ) -> Result<Vec<MessageRef>, DeliveryError> {
        if let Some(error) = self.scripted(contact_id) {
            return Err(error);
        }
        let text = caption.unwrap_or_default();
        Ok(items.iter().map(|_| self.record(contact_id, text)).collect())
    }

    async fn delete_message(&self, location: MessageLocation) -> Result<(), DeliveryError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(DeliveryError::Transient("message can't be deleted".to_string()));
        }
        self.deleted.lock().unwrap().push(location);
        Ok(())
    }

    async fn get_member_status(
        &self,
        _group_id: i64,
        contact_id: i64,
    ) -> Result<MemberStatus, DeliveryError> {
        if let Some(error) = self.scripted(contact_id) {
            return Err(error);
        }
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&contact_id)
            .copied()
            .unwrap_or(MemberStatus::Member))
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap()
}

/// Queue over an in-memory backend driven by a manual clock.
pub fn manual_queue() -> (Arc<ManualClock>, Arc<MemoryBackend>, Arc<TaskQueue>) {
    let clock = Arc::new(ManualClock::new(start_time()));
    let backend = Arc::new(MemoryBackend::default());
    let shared: SharedClock = clock.clone();
    let queue = Arc::new(TaskQueue::new(backend.clone(), shared, RetryConfig::default()));
    (clock, backend, queue)
}

pub fn ctx(task_id: &str, attempt: u32, max_attempts: u32) -> TaskContext {
    TaskContext {
        task_id: task_id.to_string(),
        attempt,
        max_attempts,
    }
}
