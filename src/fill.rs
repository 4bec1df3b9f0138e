//! Fill handler and bracket orchestrator (§4.7): updates positions and
//! realized P&L on every fill, and turns a consumed `PendingBracket` into
//! the two child stop/limit orders.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::Config;
use crate::error::{AggregatorError, Result};
use crate::models::{Fill, Order, OrderType, PendingBracket, Position, Side};
use crate::sltp;

/// Net effect of processing one fill: the updated position, the realized
/// P&L delta attributable to this fill, and any child orders to emit.
pub struct FillOutcome {
    pub position: Position,
    pub realized_pnl_delta: f64,
    pub child_orders: Vec<Order>,
}

/// Applies `fill` to `position`, averaging the entry price on same-side
/// adds and realizing P&L (net of commission) on opposite-side reductions
/// (§3, §4.7, §9).
pub fn apply_fill(position: &Position, fill: &Fill, config: &Config) -> FillOutcome {
    let mut updated = position.clone();
    let mut realized_pnl_delta = 0.0;

    let signed_fill_qty = match fill.side {
        Side::Buy => fill.quantity,
        Side::Sell => -fill.quantity,
    };

    let same_direction = updated.net_quantity == 0.0
        || (updated.net_quantity > 0.0) == (signed_fill_qty > 0.0);

    if same_direction {
        let total_qty = updated.net_quantity.abs() + signed_fill_qty.abs();
        if total_qty > 0.0 {
            updated.avg_price = (updated.avg_price * updated.net_quantity.abs()
                + fill.fill_price * signed_fill_qty.abs())
                / total_qty;
        }
        updated.net_quantity += signed_fill_qty;
    } else {
        let closing_qty = signed_fill_qty.abs().min(updated.net_quantity.abs());
        let direction = if updated.net_quantity > 0.0 { 1.0 } else { -1.0 };
        let gross_points = (fill.fill_price - updated.avg_price) * direction;

        let multiplier = config.contract_multiplier.to_f64().unwrap_or(1.0);
        let commission = commission_for(closing_qty, config);
        realized_pnl_delta = gross_points * closing_qty * multiplier - commission;

        updated.realized_pnl += realized_pnl_delta;
        updated.net_quantity += signed_fill_qty;

        if updated.net_quantity.abs() < f64::EPSILON {
            updated.avg_price = 0.0;
        } else if (updated.net_quantity > 0.0) != (position.net_quantity > 0.0) {
            // Flipped through flat: the remainder opens a new position at the fill price.
            updated.avg_price = fill.fill_price;
        }
    }

    FillOutcome {
        position: updated,
        realized_pnl_delta,
        child_orders: Vec::new(),
    }
}

fn commission_for(closing_qty: f64, config: &Config) -> f64 {
    let round_trips = Decimal::from_f64_retain(closing_qty).unwrap_or_default();
    (config.commission_per_round_trip * round_trips)
        .to_f64()
        .unwrap_or(0.0)
}

/// Turns one consumed bracket slice into its stop and take-profit children,
/// sized to that slice's quantity. Validates the resolved quantity, falling
/// back to the bracket's own quantity when the fill under-reports it
/// (§4.7, §3.1).
pub fn materialize_bracket(
    bracket: &PendingBracket,
    fill: &Fill,
    tick_size: f64,
    dollar_per_point: f64,
    min_risk_reward: f64,
) -> Result<Vec<Order>> {
    let quantity = if fill.quantity > 0.0 {
        fill.quantity as u32
    } else {
        bracket.original_quantity
    };
    if quantity == 0 {
        return Err(AggregatorError::InvalidBracketQty {
            order_id: bracket.parent_order_id.clone(),
            reason: "resolved quantity is zero".into(),
        });
    }

    let levels = sltp::compute_levels(
        bracket.stop_loss_spec,
        bracket.take_profit_spec,
        bracket.side,
        fill.fill_price,
        tick_size,
        dollar_per_point,
        min_risk_reward,
    )
    .map_err(|_| AggregatorError::InvalidBracketQty {
        order_id: bracket.parent_order_id.clone(),
        reason: "tick rounding failed while materializing bracket".into(),
    })?;

    let mut children = Vec::new();
    let child_side = bracket.side.opposite();

    if let Some(stop_price) = levels.stop_price {
        children.push(bracket_child(
            bracket,
            child_side,
            OrderType::Stop,
            stop_price,
            quantity,
            "stopLoss",
        ));
    }
    if let Some(tp_price) = levels.take_profit_price {
        children.push(bracket_child(
            bracket,
            child_side,
            OrderType::Limit,
            tp_price,
            quantity,
            "takeProfit",
        ));
    }

    if children.is_empty() {
        warn!(parent = %bracket.parent_order_id, "bracket had no stop or take-profit spec to materialize");
    }

    Ok(children)
}

fn bracket_child(
    bracket: &PendingBracket,
    side: Side,
    order_type: OrderType,
    price: f64,
    quantity: u32,
    kind: &str,
) -> Order {
    let mut metadata = std::collections::HashMap::new();
    metadata.insert(
        "parentOrderId".to_string(),
        serde_json::json!(bracket.parent_order_id),
    );
    metadata.insert("kind".to_string(), serde_json::json!(kind));
    metadata.insert("retryCount".to_string(), serde_json::json!(0));

    Order {
        id: format!("{}_{}", bracket.parent_order_id, kind),
        source: bracket.source.clone(),
        source_kind: bracket.source_kind,
        instrument: bracket.instrument.clone(),
        side,
        order_type,
        quantity,
        limit_price: if order_type == OrderType::Limit {
            Some(price)
        } else {
            None
        },
        stop_price: if order_type == OrderType::Stop {
            Some(price)
        } else {
            None
        },
        stop_loss_spec: None,
        take_profit_spec: None,
        account_id: bracket.account_id.clone(),
        urgency: false,
        metadata,
        submitted_at: std::time::Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn config() -> Config {
        Config {
            commission_per_round_trip: dec!(1.24),
            contract_multiplier: dec!(10),
            ..Config::default()
        }
    }

    #[test]
    fn opening_fill_sets_avg_price() {
        let position = Position::flat("MES".into(), "B1".into());
        let fill = Fill {
            order_id: "O1".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            fill_price: 4500.0,
            quantity: 2.0,
            timestamp: Utc::now(),
            account_id: "ACC1".into(),
            broker_id: Some("MOCK-1".into()),
        };
        let outcome = apply_fill(&position, &fill, &config());
        assert_eq!(outcome.position.net_quantity, 2.0);
        assert_eq!(outcome.position.avg_price, 4500.0);
        assert_eq!(outcome.realized_pnl_delta, 0.0);
    }

    #[test]
    fn closing_fill_realizes_pnl_net_of_commission() {
        let mut position = Position::flat("MES".into(), "B1".into());
        position.net_quantity = 2.0;
        position.avg_price = 4500.0;

        let fill = Fill {
            order_id: "O1".into(),
            instrument: "MES".into(),
            side: Side::Sell,
            fill_price: 4510.0,
            quantity: 2.0,
            timestamp: Utc::now(),
            account_id: "ACC1".into(),
            broker_id: Some("MOCK-2".into()),
        };
        let outcome = apply_fill(&position, &fill, &config());
        // 10 points * 2 contracts * $10 multiplier - 2 * $1.24 commission
        assert!((outcome.realized_pnl_delta - 197.52).abs() < 0.001);
        assert_eq!(outcome.position.net_quantity, 0.0);
    }

    #[test]
    fn bracket_materializes_stop_and_take_profit_children() {
        let bracket = PendingBracket {
            parent_order_id: "O1".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            account_id: "ACC1".into(),
            source: "B1".into(),
            source_kind: crate::models::SourceKind::Bot,
            original_quantity: 1,
            remaining_quantity: 1,
            stop_loss_spec: Some(crate::models::PriceSpec {
                kind: crate::models::StopSpecKind::Points,
                value: 4.0,
            }),
            take_profit_spec: Some(crate::models::PriceSpec {
                kind: crate::models::StopSpecKind::Points,
                value: 8.0,
            }),
            created_at: Utc::now(),
        };
        let fill = Fill {
            order_id: "O1".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            fill_price: 4500.0,
            quantity: 1.0,
            timestamp: Utc::now(),
            account_id: "ACC1".into(),
            broker_id: Some("MOCK-3".into()),
        };
        let children = materialize_bracket(&bracket, &fill, 0.25, 5.0, 1.0).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.side == Side::Sell));
    }

    #[test]
    fn bracket_falls_back_to_original_quantity_when_fill_reports_zero() {
        let bracket = PendingBracket {
            parent_order_id: "O1".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            account_id: "ACC1".into(),
            source: "B1".into(),
            source_kind: crate::models::SourceKind::Bot,
            original_quantity: 3,
            remaining_quantity: 3,
            stop_loss_spec: Some(crate::models::PriceSpec {
                kind: crate::models::StopSpecKind::Points,
                value: 4.0,
            }),
            take_profit_spec: None,
            created_at: Utc::now(),
        };
        let fill = Fill {
            order_id: "O1".into(),
            instrument: "MES".into(),
            side: Side::Buy,
            fill_price: 4500.0,
            quantity: 0.0,
            timestamp: Utc::now(),
            account_id: "ACC1".into(),
            broker_id: None,
        };
        let children = materialize_bracket(&bracket, &fill, 0.25, 5.0, 1.0).unwrap();
        assert_eq!(children[0].quantity, 3);
    }
}
