//! Message Bus Adapter (§4.1).
//!
//! Publish/subscribe over a pub/sub broker with JSON-encoded payloads.
//! Handler invocations for one subscription are serialized; delivery is
//! best-effort, at-most-once.

pub mod channels;
pub mod inprocess;
pub mod ws;

use async_trait::async_trait;
use serde::Serialize;

pub use inprocess::InProcessBus;
pub use ws::WsBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// A single decoded message delivered to a subscriber: the raw JSON payload
/// plus the channel it arrived on (needed for wildcard-style subscriptions
/// like per-bot response channels).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// JSON-encodes `payload` and publishes it to `channel`. Best-effort: if
    /// the bus is disconnected the publish is dropped (§7 BusDisconnected)
    /// and a metric is incremented by the caller.
    async fn publish_value(&self, channel: &str, payload: serde_json::Value);

    /// Subscribes to `channel`, returning a receiver of decoded messages.
    /// Message order within one subscription is preserved (§5).
    async fn subscribe(&self, channel: &str) -> tokio::sync::mpsc::Receiver<BusMessage>;

    fn connection_status(&self) -> ConnectionStatus;
}

/// Convenience wrapper that JSON-serializes `payload` before handing it to
/// `publish_value`, so call sites can pass any `Serialize` type.
pub async fn publish<B: Bus + ?Sized, T: Serialize>(bus: &B, channel: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => bus.publish_value(channel, value).await,
        Err(err) => tracing::warn!(channel, error = %err, "failed to serialize bus payload"),
    }
}
