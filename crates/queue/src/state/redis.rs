//! Redis state store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fred::clients::{Client, SubscriberClient};
use fred::interfaces::{
    ClientLike, EventInterface, HashesInterface, KeysInterface, ListInterface, PubsubInterface,
};
use fred::types::config::Config as RedisConfig;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{SUBSCRIPTION_BUFFER, StateStore};
use crate::error::QueueError;

/// State store backed by Redis, with a dedicated subscriber connection.
///
/// The subscriber connection stays subscribed to a channel while at least one
/// local receiver is open on it.
#[derive(Clone)]
pub struct RedisStateStore {
    client: Client,
    subscriber: SubscriberClient,
    listeners: Arc<Mutex<HashMap<String, usize>>>,
}

impl RedisStateStore {
    /// Connect both the command and the subscriber client.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let config = RedisConfig::from_url(url)?;

        let client = Client::new(config.clone(), None, None, None);
        client.init().await?;

        let subscriber = SubscriberClient::new(config, None, None, None);
        subscriber.init().await?;

        info!("Redis state store initialized");

        Ok(Self {
            client,
            subscriber,
            listeners: Arc::default(),
        })
    }

    /// Command client, shared with the task backend.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Open local receivers on `channel`.
    pub async fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .lock()
            .await
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Close both connections.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.subscriber.quit().await?;
        self.client.quit().await?;
        info!("Redis state store shut down");
        Ok(())
    }
}

/// Drop one local listener, unsubscribing the connection after the last.
async fn release_listener(
    subscriber: &SubscriberClient,
    listeners: &Mutex<HashMap<String, usize>>,
    channel: &str,
) {
    let mut listeners = listeners.lock().await;
    let Some(count) = listeners.get_mut(channel) else {
        return;
    };
    *count = count.saturating_sub(1);
    if *count > 0 {
        return;
    }
    listeners.remove(channel);
    match subscriber.unsubscribe(channel).await {
        Ok(()) => debug!(channel, "Unsubscribed from channel"),
        Err(e) => warn!(channel, error = %e, "Failed to unsubscribe"),
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.client.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.client
            .set::<(), _, _>(key, value, None, None, false)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        self.client.del::<(), _>(key).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        Ok(self.client.hgetall(key).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), QueueError> {
        if fields.is_empty() {
            return Ok(());
        }
        let values: HashMap<String, String> = fields
            .iter()
            .map(|(field, value)| ((*field).to_string(), value.clone()))
            .collect();
        self.client.hset::<(), _, _>(key, values).await?;
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, QueueError> {
        let written: i64 = self.client.hsetnx(key, field, value).await?;
        Ok(written == 1)
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, QueueError> {
        Ok(self.client.hincrby(key, field, by).await?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), QueueError> {
        self.client.hdel::<(), _, _>(key, field).await?;
        Ok(())
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        capacity: usize,
    ) -> Result<(), QueueError> {
        self.client.rpush::<(), _, _>(key, value).await?;
        self.client
            .ltrim::<(), _>(key, -to_i64(capacity.max(1)), -1)
            .await?;
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, QueueError> {
        Ok(self.client.lrange(key, 0, -1).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), QueueError> {
        self.client.publish::<(), _, _>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, QueueError> {
        let mut messages = self.subscriber.message_rx();
        {
            let mut listeners = self.listeners.lock().await;
            let count = listeners.entry(channel.to_string()).or_insert(0);
            if *count == 0 {
                if let Err(e) = self.subscriber.subscribe(channel).await {
                    listeners.remove(channel);
                    return Err(e.into());
                }
                debug!(channel, "Subscribed to channel");
            }
            *count += 1;
        }

        let wanted = channel.to_string();
        let subscriber = self.subscriber.clone();
        let listeners = self.listeners.clone();
        let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = tx.closed() => break,
                    received = messages.recv() => received,
                };
                match received {
                    Ok(message) => {
                        if &*message.channel != wanted.as_str() {
                            continue;
                        }
                        let Some(payload) = message.value.as_string() else {
                            continue;
                        };
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            release_listener(&subscriber, &listeners, &wanted).await;
            debug!(channel = %wanted, "Channel forwarder stopped");
        });

        Ok(out)
    }
}
