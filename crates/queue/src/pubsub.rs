//! Typed publish/subscribe over the state store.
//!
//! Events are JSON-encoded on publish and decoded per subscriber; undecodable
//! messages are logged and dropped.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::state::{SUBSCRIPTION_BUFFER, StateStore};

/// Pub/Sub channel names.
pub mod channels {
    /// Progress events of a broadcast session.
    #[must_use]
    pub fn broadcast_events(prefix: &str, session_id: &str) -> String {
        format!("{prefix}:broadcast:{session_id}:events")
    }
}

/// Publisher and subscriber for events of type `E`.
pub struct EventBus<E> {
    store: Arc<dyn StateStore>,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _event: PhantomData,
        }
    }
}

impl<E> EventBus<E>
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a bus on top of `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            _event: PhantomData,
        }
    }

    /// Publish an event to a channel.
    pub async fn publish(&self, channel: &str, event: &E) -> Result<(), QueueError> {
        let payload = serde_json::to_string(event)?;
        self.store.publish(channel, &payload).await?;
        debug!(channel, "Published event");
        Ok(())
    }

    /// Decoded events published on `channel` from now on.
    ///
    /// Dropping the receiver ends the subscription.
    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<E>, QueueError> {
        let mut raw = self.store.subscribe(channel).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    () = tx.closed() => break,
                    payload = raw.recv() => payload,
                };
                let Some(payload) = payload else {
                    break;
                };
                match serde_json::from_str::<E>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Failed to parse Pub/Sub message"),
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "payload", rename_all = "camelCase")]
    enum Event {
        Log(String),
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let bus = EventBus::<Event>::new(store.clone());
        let mut rx = bus.subscribe("c").await.unwrap();

        store.publish("c", "not json").await.unwrap();
        bus.publish("c", &Event::Log("hi".to_string())).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Event::Log("hi".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_receiver_ends_subscription() {
        let memory = Arc::new(MemoryStateStore::new());
        let bus = EventBus::<Event>::new(memory.clone());

        for _ in 0..100 {
            let rx = bus.subscribe("c").await.unwrap();
            drop(rx);
        }
        for _ in 0..1000 {
            if memory.channel_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(memory.channel_count(), 0);
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(
            channels::broadcast_events("herald", "s1"),
            "herald:broadcast:s1:events"
        );
    }
}
