//! Shared state store.
//!
//! Key/value strings, hashes with atomic counters, bounded lists and a
//! publish/subscribe channel. Broadcast sessions keep their progress here so
//! that any worker process can pick up a batch.

mod memory;
mod redis;

pub use memory::MemoryStateStore;
pub use redis::RedisStateStore;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::QueueError;

/// Buffered messages per subscription before the publisher side starts dropping.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Durable shared state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError>;

    async fn delete(&self, key: &str) -> Result<(), QueueError>;

    /// All fields of a hash; empty if the key is missing.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, QueueError>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), QueueError>;

    /// Set a field only if absent. Returns `true` if it was written.
    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, QueueError>;

    /// Atomically add `by` to an integer field, returning the new value.
    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, QueueError>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), QueueError>;

    /// Append to a list, keeping only the newest `capacity` entries.
    async fn push_bounded(&self, key: &str, value: &str, capacity: usize)
    -> Result<(), QueueError>;

    /// Whole list, oldest first.
    async fn range(&self, key: &str) -> Result<Vec<String>, QueueError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), QueueError>;

    /// Messages published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, QueueError>;
}
