//! `tokio-tungstenite` client to an external pub/sub broker, with the same
//! exponential-backoff-with-jitter reconnect idiom used by this codebase's
//! market-data session managers (`scrapers::binance_session`), adapted for
//! broker reconnects rather than exchange websockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use super::{Bus, BusMessage, ConnectionStatus};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct WsBusConfig {
    pub url: String,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub ping_interval: Duration,
}

impl Default for WsBusConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:6379".to_string(),
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// `min(base * 2^n, cap)` plus up to ±20% jitter (§4.1).
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    fn next(&mut self) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(self.attempt as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = capped * (rand::random::<f64>() * 0.4 - 0.2);
        self.attempt += 1;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireFrame {
    channel: String,
    payload: serde_json::Value,
}

#[derive(Clone)]
pub struct WsBus {
    config: WsBusConfig,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>,
    outbound: mpsc::Sender<WireFrame>,
    connected: Arc<AtomicBool>,
}

impl WsBus {
    /// Spawns the connect/reconnect supervisor and returns a handle usable
    /// immediately; publishes while disconnected are dropped per §7.
    pub fn connect(config: WsBusConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let bus = Self {
            config: config.clone(),
            channels: Arc::new(RwLock::new(HashMap::new())),
            outbound: outbound_tx,
            connected: Arc::new(AtomicBool::new(false)),
        };
        bus.spawn_supervisor(outbound_rx);
        bus
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

    fn spawn_supervisor(&self, mut outbound_rx: mpsc::Receiver<WireFrame>) {
        let config = self.config.clone();
        let channels = self.channels.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
            loop {
                match tokio_tungstenite::connect_async(&config.url).await {
                    Ok((stream, _)) => {
                        info!(url = %config.url, "message bus connected");
                        connected.store(true, Ordering::SeqCst);
                        backoff.reset();

                        let (mut write, mut read) = stream.split();
                        let channels_for_read = channels.clone();

                        let read_task = async {
                            while let Some(msg) = read.next().await {
                                match msg {
                                    Ok(Message::Text(text)) => {
                                        match serde_json::from_str::<WireFrame>(&text) {
                                            Ok(frame) => {
                                                let tx = {
                                                    let mut map = channels_for_read.write();
                                                    map.entry(frame.channel.clone())
                                                        .or_insert_with(|| {
                                                            broadcast::channel(CHANNEL_CAPACITY).0
                                                        })
                                                        .clone()
                                                };
                                                let _ = tx.send(BusMessage {
                                                    channel: frame.channel,
                                                    payload: frame.payload,
                                                });
                                            }
                                            Err(err) => {
                                                warn!(error = %err, "malformed bus frame, dropped")
                                            }
                                        }
                                    }
                                    Ok(Message::Close(_)) => break,
                                    Ok(_) => {}
                                    Err(err) => {
                                        warn!(error = %err, "bus read error");
                                        break;
                                    }
                                }
                            }
                        };

                        let write_task = async {
                            while let Some(frame) = outbound_rx.recv().await {
                                let Ok(text) = serde_json::to_string(&frame) else {
                                    continue;
                                };
                                if write.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        };

                        tokio::select! {
                            _ = read_task => {}
                            _ = write_task => {}
                        }

                        connected.store(false, Ordering::SeqCst);
                        warn!("message bus disconnected, will reconnect");
                    }
                    Err(err) => {
                        warn!(error = %err, url = %config.url, "message bus connect failed");
                    }
                }

                let delay = backoff.next();
                tokio::time::sleep(delay).await;
            }
        });
    }
}

#[async_trait]
impl Bus for WsBus {
    async fn publish_value(&self, channel: &str, payload: serde_json::Value) {
        if !self.connected.load(Ordering::SeqCst) {
            warn!(channel, "bus disconnected, dropping publish");
            return;
        }
        let frame = WireFrame {
            channel: channel.to_string(),
            payload,
        };
        let _ = self.outbound.try_send(frame);
    }

    async fn subscribe(&self, channel: &str) -> mpsc::Receiver<BusMessage> {
        let mut broadcast_rx = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    fn connection_status(&self) -> ConnectionStatus {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let first = backoff.next();
        assert!(first.as_millis() <= 130);
        for _ in 0..20 {
            let d = backoff.next();
            assert!(d.as_millis() as u64 <= 1200);
        }
    }
}
