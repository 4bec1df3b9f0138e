//! Canonical data model shared by every component of the core (§3).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type OrderId = String;
pub type SourceId = String;
pub type AccountId = String;
pub type Instrument = String;

/// Monotonic timestamp used for ordering within a single process run.
pub type Monotonic = Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Parse from the many synonyms the legacy intake shapes use (§4.2).
    pub fn from_synonym(raw: &str) -> Option<Side> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Some(Side::Buy),
            "SELL" | "SHORT" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    /// Synthetic types used only for priority derivation on bracket children
    /// and modify/cancel requests (§4.4); never produced directly by intake.
    StopLoss,
    TakeProfit,
    Modify,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Queued,
    Processing,
    Sent,
    Filled,
    PartiallyFilled,
    Rejected,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Failed
                | OrderStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSpecKind {
    Points,
    Dollars,
    Price,
    Percent,
    Atr,
}

/// A stop-loss or take-profit specification attached to an order, deferred
/// until the parent's fill price is known (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSpec {
    pub kind: StopSpecKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    Bot,
    Manual,
    Api,
    Strategy,
    External,
}

fn default_source_kind() -> SourceKind {
    SourceKind::External
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceStatus {
    Active,
    Paused,
    Disabled,
    Maintenance,
}

/// Canonical, immutable-after-normalization order (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub source: SourceId,
    #[serde(default = "default_source_kind")]
    pub source_kind: SourceKind,
    pub instrument: Instrument,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: u32,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub stop_loss_spec: Option<PriceSpec>,
    pub take_profit_spec: Option<PriceSpec>,
    pub account_id: AccountId,
    pub urgency: bool,
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip, default = "Instant::now")]
    pub submitted_at: Monotonic,
}

impl Order {
    /// Enforces the Order invariants of §3: positive quantity and the
    /// type-dependent required price fields.
    pub fn validate_shape(&self) -> Result<(), String> {
        if self.quantity == 0 {
            return Err("quantity must be > 0".into());
        }
        if self.order_type == OrderType::Limit && self.limit_price.is_none() {
            return Err("LIMIT order requires limitPrice".into());
        }
        if self.order_type == OrderType::Stop && self.stop_price.is_none() {
            return Err("STOP order requires stopPrice".into());
        }
        Ok(())
    }

    pub fn retry_count(&self) -> u8 {
        self.metadata
            .get("retryCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u8
    }

    pub fn with_retry_count(mut self, count: u8) -> Self {
        self.metadata
            .insert("retryCount".to_string(), serde_json::json!(count));
        self
    }

    pub fn parent_order_id(&self) -> Option<&str> {
        self.metadata.get("parentOrderId").and_then(|v| v.as_str())
    }
}

/// Mutable lifecycle wrapper around an `Order` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    #[serde(flatten)]
    pub order: Order,
    pub status: OrderStatus,
    pub queue_id: Option<String>,
    #[serde(skip)]
    pub queued_at: Option<Monotonic>,
    #[serde(skip)]
    pub dispatched_at: Option<Monotonic>,
    #[serde(skip, default = "Instant::now")]
    pub last_update: Monotonic,
    pub error: Option<String>,
    pub broker_id: Option<String>,
}

impl TrackedOrder {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            status: OrderStatus::Queued,
            queue_id: None,
            queued_at: None,
            dispatched_at: None,
            last_update: Instant::now(),
            error: None,
            broker_id: None,
        }
    }

    /// Applies a status transition, refusing to leave a terminal state
    /// except for the explicit PARTIAL -> FILLED progression (§3).
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "order {} is terminal ({:?}), cannot transition to {:?}",
                self.order.id, self.status, next
            ));
        }
        if self.status == OrderStatus::PartiallyFilled && next == OrderStatus::PartiallyFilled {
            // repeated partials are fine
        }
        self.status = next;
        self.last_update = Instant::now();
        Ok(())
    }
}

/// Broker-reported execution of an order, possibly partial (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub instrument: Instrument,
    pub side: Side,
    pub fill_price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    pub account_id: AccountId,
    pub broker_id: Option<String>,
}

/// Per `(instrument, source)` position (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub source: SourceId,
    pub net_quantity: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(instrument: Instrument, source: SourceId) -> Self {
        Self {
            instrument,
            source,
            net_quantity: 0.0,
            avg_price: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            opened_at: Utc::now(),
        }
    }

    pub fn key(instrument: &str, source: &str) -> String {
        format!("{instrument}::{source}")
    }
}

/// Stop-loss/take-profit specs parked at dispatch time. A slice of it is
/// consumed on each fill against the parent, sized to that fill's quantity,
/// until `remaining_quantity` reaches zero (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBracket {
    pub parent_order_id: OrderId,
    pub instrument: Instrument,
    pub side: Side,
    pub account_id: AccountId,
    pub source: SourceId,
    #[serde(default = "default_source_kind")]
    pub source_kind: SourceKind,
    pub original_quantity: u32,
    #[serde(default)]
    pub remaining_quantity: u32,
    pub stop_loss_spec: Option<PriceSpec>,
    pub take_profit_spec: Option<PriceSpec>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    MinOrderSize,
    MaxOrderSize,
    MaxPositions,
    DailyLossLimit,
    DailyProfitLimit,
    OutsideTradingHours,
    ExcessiveRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskViolation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub order_id: OrderId,
    pub violation: RiskViolation,
    pub occurred_at: DateTime<Utc>,
}

/// Cached account balance with a TTL (§4.3, §3.1).
#[derive(Debug, Clone, Copy)]
pub struct CachedBalance {
    pub balance: f64,
    pub fetched_at: Instant,
}

/// Process-wide mutable risk state, owned by a single task (§3).
#[derive(Debug)]
pub struct RiskState {
    pub daily_pnl: f64,
    pub daily_loss_count: u32,
    pub open_positions: HashMap<String, Position>,
    pub violation_history: VecDeque<ViolationRecord>,
    pub cached_balance: Option<CachedBalance>,
    pub trading_day: DateTime<Utc>,
}

impl RiskState {
    pub fn new() -> Self {
        Self {
            daily_pnl: 0.0,
            daily_loss_count: 0,
            open_positions: HashMap::new(),
            violation_history: VecDeque::new(),
            cached_balance: None,
            trading_day: Utc::now(),
        }
    }

    /// Resets the daily counters at a trading-day boundary (§3, §6).
    pub fn reset_daily(&mut self) {
        self.daily_pnl = 0.0;
        self.daily_loss_count = 0;
        self.trading_day = Utc::now();
    }

    /// Drops violations older than the 7-day retention window (§3).
    pub fn prune_violations(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(7);
        while let Some(front) = self.violation_history.front() {
            if front.occurred_at < cutoff {
                self.violation_history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_violation(&mut self, order_id: OrderId, violation: RiskViolation) {
        self.violation_history.push_back(ViolationRecord {
            order_id,
            violation,
            occurred_at: Utc::now(),
        });
        self.prune_violations(Utc::now());
    }
}

impl Default for RiskState {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered producer of orders (§3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub orders_total: u64,
    pub orders_success: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
    #[serde(skip, default = "Instant::now")]
    pub last_activity: Monotonic,
}

impl Source {
    pub fn new(id: SourceId, kind: SourceKind) -> Self {
        Self {
            id,
            kind,
            status: SourceStatus::Active,
            orders_total: 0,
            orders_success: 0,
            orders_rejected: 0,
            orders_cancelled: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.orders_total == 0 {
            return 1.0;
        }
        self.orders_success as f64 / self.orders_total as f64
    }
}

/// Per-`orderId` exclusive lock with a TTL (§3, §4.8).
#[derive(Debug, Clone, Copy)]
pub struct Lock {
    pub lock_id: uuid::Uuid,
    pub locked_at: Instant,
    pub ttl: Duration,
}

impl Lock {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.locked_at) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_synonyms_collapse() {
        assert_eq!(Side::from_synonym("buy"), Some(Side::Buy));
        assert_eq!(Side::from_synonym("LONG"), Some(Side::Buy));
        assert_eq!(Side::from_synonym("Sell"), Some(Side::Sell));
        assert_eq!(Side::from_synonym("short"), Some(Side::Sell));
        assert_eq!(Side::from_synonym("sideways"), None);
    }

    #[test]
    fn zero_quantity_is_invalid() {
        let order = sample_order(0);
        assert!(order.validate_shape().is_err());
    }

    #[test]
    fn limit_without_price_is_invalid() {
        let mut order = sample_order(1);
        order.order_type = OrderType::Limit;
        order.limit_price = None;
        assert!(order.validate_shape().is_err());
    }

    #[test]
    fn tracked_order_cannot_leave_terminal_state() {
        let mut tracked = TrackedOrder::new(sample_order(1));
        tracked.transition(OrderStatus::Rejected).unwrap();
        assert!(tracked.transition(OrderStatus::Sent).is_err());
    }

    fn sample_order(qty: u32) -> Order {
        Order {
            id: "O1".into(),
            source: "B1".into(),
            source_kind: SourceKind::Bot,
            instrument: "MES".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            limit_price: None,
            stop_price: None,
            stop_loss_spec: None,
            take_profit_spec: None,
            account_id: "ACC1".into(),
            urgency: false,
            metadata: HashMap::new(),
            submitted_at: Instant::now(),
        }
    }
}
