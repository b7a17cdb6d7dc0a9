//! In-process state store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{SUBSCRIPTION_BUFFER, StateStore};
use crate::error::QueueError;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// State store kept in memory.
///
/// A channel lives as long as it has at least one subscriber.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels that currently have a subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, QueueError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| QueueError::Serialization(format!("{key}.{field}: {e}")))?,
            None => 0,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), QueueError> {
        if let Some(hash) = self.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        capacity: usize,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        while list.len() > capacity {
            list.pop_front();
        }
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, QueueError> {
        Ok(self
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), QueueError> {
        if let Some(tx) = self.lock().channels.get(channel) {
            // No receivers is fine.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, QueueError> {
        let mut rx = self
            .lock()
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .subscribe();

        let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let inner = self.inner.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = tx.closed() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            drop(rx);
            let mut inner = lock_inner(&inner);
            let idle = inner
                .channels
                .get(&channel)
                .is_some_and(|sender| sender.receiver_count() == 0);
            if idle {
                inner.channels.remove(&channel);
            }
        });

        Ok(out)
    }
}
