//! Error taxonomy for the order-routing core.
//!
//! Every handler-level failure is converted to one of these variants before
//! it can escape a message-bus subscription; the bus itself never sees an
//! unhandled panic or a raw transport error.

use thiserror::Error;

use crate::models::{OrderId, RiskViolation};

pub type Result<T> = std::result::Result<T, AggregatorError>;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("malformed order: {reason}")]
    MalformedOrder { reason: String },

    #[error("order {order_id} rejected by risk manager: {violations:?}")]
    RiskViolation {
        order_id: OrderId,
        violations: Vec<RiskViolation>,
    },

    #[error("queue is full (size={size}, cap={cap})")]
    QueueFull { size: usize, cap: usize },

    #[error("dispatch of order {order_id} failed: {reason}")]
    DispatchFailure { order_id: OrderId, reason: String },

    #[error("fill references unknown order {order_id}")]
    FillUnassociated { order_id: OrderId },

    #[error("bracket for order {order_id} has invalid quantity: {reason}")]
    InvalidBracketQty { order_id: OrderId, reason: String },

    #[error("timed out acquiring lock for {key} after {timeout_ms}ms")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("message bus disconnected")]
    BusDisconnected,

    #[error("broker gateway unreachable: {reason}")]
    GatewayUnreachable { reason: String },

    #[error("tick size must be positive and price finite (tick_size={tick_size}, price={price})")]
    InvalidTick { tick_size: f64, price: f64 },

    #[error("unknown or unauthorized source: {source_id}")]
    UnknownSource { source_id: String },
}

impl AggregatorError {
    /// Stable machine-readable tag, used on the wire (`{success:false, reason:"..."}`).
    pub fn reason_tag(&self) -> &'static str {
        match self {
            AggregatorError::MalformedOrder { .. } => "MALFORMED",
            AggregatorError::RiskViolation { .. } => "RISK_VIOLATION",
            AggregatorError::QueueFull { .. } => "QUEUE_FULL",
            AggregatorError::DispatchFailure { .. } => "DISPATCH_FAILURE",
            AggregatorError::FillUnassociated { .. } => "FILL_UNASSOCIATED",
            AggregatorError::InvalidBracketQty { .. } => "INVALID_BRACKET_QTY",
            AggregatorError::LockTimeout { .. } => "LOCK_TIMEOUT",
            AggregatorError::BusDisconnected => "BUS_DISCONNECTED",
            AggregatorError::GatewayUnreachable { .. } => "GATEWAY_UNREACHABLE",
            AggregatorError::InvalidTick { .. } => "INVALID_TICK",
            AggregatorError::UnknownSource { .. } => "UNKNOWN_SOURCE",
        }
    }
}
