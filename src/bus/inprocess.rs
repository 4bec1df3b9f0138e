//! In-memory bus backed by `tokio::sync::broadcast`, used by tests and by
//! single-process deployments that don't need an external broker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{Bus, BusMessage, ConnectionStatus};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct InProcessBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn publish_value(&self, channel: &str, payload: serde_json::Value) {
        let tx = self.sender_for(channel);
        // No subscribers is a normal, non-error condition for a pub/sub bus.
        let _ = tx.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
    }

    async fn subscribe(&self, channel: &str) -> mpsc::Receiver<BusMessage> {
        let mut broadcast_rx = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel_name = channel.to_string();
        // One dedicated task per subscription forwards broadcast deliveries
        // onto the subscriber's own mpsc channel, serializing handler
        // invocations for this subscription (§4.1).
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %channel_name, dropped = n, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::publish;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = InProcessBus::new();
        let mut rx = bus.subscribe("orders-in").await;
        publish(&bus, "orders-in", &serde_json::json!({"id": "O1"})).await;
        let msg = rx.recv().await.expect("message");
        assert_eq!(msg.channel, "orders-in");
        assert_eq!(msg.payload["id"], "O1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = InProcessBus::new();
        publish(&bus, "nobody-listening", &serde_json::json!({})).await;
    }
}
