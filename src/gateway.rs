//! Broker gateway RPC binding (§4.5.1): submits orders and fetches account
//! state over HTTP, in the same request/response envelope idiom as this
//! codebase's `scrapers::dome_rest::DomeRestClient`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AggregatorError, Result};
use crate::models::{AccountId, Instrument, Order};

#[derive(Debug, Clone, Serialize)]
pub struct SetSlTpRequest {
    pub instrument: Instrument,
    pub account_id: AccountId,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAck {
    pub broker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub instrument: Instrument,
    pub net_quantity: f64,
    pub avg_price: f64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Everything the dispatcher, SL/TP calculator and risk manager need from
/// the broker; implemented once over HTTP and once as an in-memory mock for
/// deterministic scenario tests (§4.5.1).
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn submit_order(&self, order: &Order) -> Result<BrokerAck>;
    async fn get_balance(&self, account_id: &str) -> Result<f64>;
    async fn get_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>>;
    async fn set_position_sltp(&self, req: SetSlTpRequest) -> Result<()>;
    async fn retrieve_bars(&self, instrument: &str, count: u32) -> Result<Vec<f64>>;
}

/// `reqwest`-backed gateway client, mirroring `DomeRestClient`'s
/// base-url-plus-timeout construction and `{success, data|error}` envelope.
pub struct HttpGatewayClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static TLS config");
        Self { base_url, client }
    }

    async fn post<B: Serialize + Sync, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| AggregatorError::GatewayUnreachable {
                reason: err.to_string(),
            })?;

        let envelope: Envelope<T> =
            resp.json()
                .await
                .map_err(|err| AggregatorError::GatewayUnreachable {
                    reason: format!("malformed gateway response: {err}"),
                })?;

        if !envelope.success {
            return Err(AggregatorError::GatewayUnreachable {
                reason: envelope.error.unwrap_or_else(|| "unknown gateway error".into()),
            });
        }
        envelope.data.ok_or_else(|| AggregatorError::GatewayUnreachable {
            reason: "gateway reported success with no data".into(),
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await.map_err(|err| {
            AggregatorError::GatewayUnreachable {
                reason: err.to_string(),
            }
        })?;
        let envelope: Envelope<T> =
            resp.json()
                .await
                .map_err(|err| AggregatorError::GatewayUnreachable {
                    reason: format!("malformed gateway response: {err}"),
                })?;
        if !envelope.success {
            return Err(AggregatorError::GatewayUnreachable {
                reason: envelope.error.unwrap_or_else(|| "unknown gateway error".into()),
            });
        }
        envelope.data.ok_or_else(|| AggregatorError::GatewayUnreachable {
            reason: "gateway reported success with no data".into(),
        })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn submit_order(&self, order: &Order) -> Result<BrokerAck> {
        self.post("/orders", order).await
    }

    async fn get_balance(&self, account_id: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Balance {
            balance: f64,
        }
        let balance: Balance = self
            .get(&format!("/accounts/{account_id}/balance"))
            .await?;
        Ok(balance.balance)
    }

    async fn get_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>> {
        self.get(&format!("/accounts/{account_id}/positions")).await
    }

    async fn set_position_sltp(&self, req: SetSlTpRequest) -> Result<()> {
        let _: serde_json::Value = self.post("/positions/sltp", &req).await?;
        Ok(())
    }

    async fn retrieve_bars(&self, instrument: &str, count: u32) -> Result<Vec<f64>> {
        self.get(&format!("/bars/{instrument}?count={count}")).await
    }
}

/// Deterministic in-memory gateway used by the scenario test suite (§11).
pub struct MockGatewayClient {
    balances: Mutex<HashMap<String, f64>>,
    positions: Mutex<HashMap<String, Vec<BrokerPosition>>>,
    next_broker_id: Mutex<u64>,
    fail_submits: bool,
}

impl MockGatewayClient {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            next_broker_id: Mutex::new(1),
            fail_submits: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_submits: true,
            ..Self::new()
        }
    }

    pub fn set_balance(&self, account_id: &str, balance: f64) {
        self.balances.lock().insert(account_id.to_string(), balance);
    }
}

impl Default for MockGatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayClient for MockGatewayClient {
    async fn submit_order(&self, order: &Order) -> Result<BrokerAck> {
        if self.fail_submits {
            warn!(order_id = %order.id, "mock gateway configured to fail submits");
            return Err(AggregatorError::DispatchFailure {
                order_id: order.id.clone(),
                reason: "mock gateway unreachable".into(),
            });
        }
        let mut counter = self.next_broker_id.lock();
        let id = *counter;
        *counter += 1;
        Ok(BrokerAck {
            broker_id: format!("MOCK-{id}"),
        })
    }

    async fn get_balance(&self, account_id: &str) -> Result<f64> {
        Ok(self
            .balances
            .lock()
            .get(account_id)
            .copied()
            .unwrap_or(10_000.0))
    }

    async fn get_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>> {
        Ok(self
            .positions
            .lock()
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_position_sltp(&self, _req: SetSlTpRequest) -> Result<()> {
        Ok(())
    }

    async fn retrieve_bars(&self, _instrument: &str, count: u32) -> Result<Vec<f64>> {
        Ok(vec![0.0; count as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_order() -> Order {
        Order {
            id: "O1".into(),
            source: "B1".into(),
            source_kind: crate::models::SourceKind::Bot,
            instrument: "MES".into(),
            side: crate::models::Side::Buy,
            order_type: crate::models::OrderType::Market,
            quantity: 1,
            limit_price: None,
            stop_price: None,
            stop_loss_spec: None,
            take_profit_spec: None,
            account_id: "ACC1".into(),
            urgency: false,
            metadata: Map::new(),
            submitted_at: std::time::Instant::now(),
        }
    }

    #[tokio::test]
    async fn mock_gateway_acknowledges_submissions() {
        let gateway = MockGatewayClient::new();
        let ack = gateway.submit_order(&sample_order()).await.unwrap();
        assert!(ack.broker_id.starts_with("MOCK-"));
    }

    #[tokio::test]
    async fn failing_mock_gateway_returns_dispatch_failure() {
        let gateway = MockGatewayClient::failing();
        let err = gateway.submit_order(&sample_order()).await.unwrap_err();
        assert_eq!(err.reason_tag(), "DISPATCH_FAILURE");
    }
}
