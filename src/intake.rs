//! Intake / Normalizer (§4.2): accepts direct canonical, `MANUAL_ORDER`, and
//! `PLACE_ORDER` shapes on `orders-in` and produces a canonical `Order`.

use std::collections::HashMap;

use rand::Rng;
use serde_json::Value;

use crate::error::{AggregatorError, Result};
use crate::models::{Order, OrderType, PriceSpec, Side, SourceKind, StopSpecKind};

/// Generates a monotonic id `SOURCE_<timestamp>_<rand>` when the inbound
/// payload omits one (§4.2).
pub fn generate_order_id(source: &str) -> String {
    let ts = chrono::Utc::now().timestamp_millis();
    let rand_suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{source}_{ts}_{rand_suffix:06}")
}

/// Normalizes one raw `orders-in` payload into a canonical `Order`.
///
/// Accepts a direct canonical shape, `{type: "MANUAL_ORDER", order: {...}}`,
/// and the legacy `{type: "PLACE_ORDER", payload: {...}}` shape; all three
/// funnel through the same field-extraction rules.
pub fn normalize(raw: &Value, default_source: &str) -> Result<Order> {
    let envelope_type = raw.get("type").and_then(Value::as_str);
    let body = match envelope_type {
        Some("MANUAL_ORDER") => raw.get("order").unwrap_or(raw),
        Some("PLACE_ORDER") => raw.get("payload").unwrap_or(raw),
        _ => raw,
    };

    let source_kind = parse_source_kind(raw, body, envelope_type);

    let source = raw
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or(default_source)
        .to_string();

    let instrument = first_str(body, &["instrument", "symbol"]).ok_or_else(|| {
        AggregatorError::MalformedOrder {
            reason: "missing instrument".into(),
        }
    })?;

    let side_raw = first_str(body, &["side", "action"]).ok_or_else(|| {
        AggregatorError::MalformedOrder {
            reason: "missing side".into(),
        }
    })?;
    let side = Side::from_synonym(&side_raw).ok_or_else(|| AggregatorError::MalformedOrder {
        reason: format!("unrecognized side '{side_raw}'"),
    })?;

    let quantity = first_num(body, &["quantity", "qty"])
        .filter(|q| *q > 0.0)
        .ok_or_else(|| AggregatorError::MalformedOrder {
            reason: "missing or non-positive quantity".into(),
        })? as u32;

    let order_type = body
        .get("type")
        .and_then(Value::as_str)
        .and_then(parse_order_type)
        .unwrap_or(OrderType::Market);

    let limit_price = first_num(body, &["limitPrice"]);
    let stop_price = first_num(body, &["stopPrice"]);

    let id = first_str(body, &["id", "orderId"]).unwrap_or_else(|| generate_order_id(&source));

    let stop_loss_spec = extract_spec(body, "stopLossSpec", "stopLossPoints", "stopLoss");
    let take_profit_spec = extract_spec(body, "takeProfitSpec", "takeProfitPoints", "takeProfit");

    let account_id = first_str(body, &["accountId", "account"]).unwrap_or_default();
    let urgency = body
        .get("urgency")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut metadata: HashMap<String, Value> = body
        .get("metadata")
        .and_then(|m| m.as_object())
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default();
    metadata.entry("retryCount".to_string()).or_insert(Value::from(0));

    let order = Order {
        id,
        source,
        source_kind,
        instrument,
        side,
        order_type,
        quantity,
        limit_price,
        stop_price,
        stop_loss_spec,
        take_profit_spec,
        account_id,
        urgency,
        metadata,
        submitted_at: std::time::Instant::now(),
    };

    order
        .validate_shape()
        .map_err(|reason| AggregatorError::MalformedOrder { reason })?;

    Ok(order)
}

/// Determines the producer kind the registry should validate this order
/// against (§4.9). Honors an explicit `sourceKind`/`sourceType` field first,
/// falls back to the envelope shape (`MANUAL_ORDER` implies `MANUAL`), and
/// defaults to `EXTERNAL` for a bare canonical payload.
fn parse_source_kind(raw: &Value, body: &Value, envelope_type: Option<&str>) -> SourceKind {
    if let Some(kind_str) = first_str(raw, &["sourceKind", "sourceType"])
        .or_else(|| first_str(body, &["sourceKind", "sourceType"]))
    {
        if let Ok(kind) =
            serde_json::from_value::<SourceKind>(Value::String(kind_str.to_uppercase()))
        {
            return kind;
        }
    }
    match envelope_type {
        Some("MANUAL_ORDER") => SourceKind::Manual,
        _ => SourceKind::External,
    }
}

fn first_str(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| body.get(k)).and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn first_num(body: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| body.get(k)).and_then(Value::as_f64)
}

fn parse_order_type(raw: &str) -> Option<OrderType> {
    match raw.to_ascii_uppercase().as_str() {
        "MARKET" => Some(OrderType::Market),
        "LIMIT" => Some(OrderType::Limit),
        "STOP" => Some(OrderType::Stop),
        _ => None,
    }
}

fn extract_spec(body: &Value, spec_key: &str, points_key: &str, price_key: &str) -> Option<PriceSpec> {
    if let Some(spec) = body.get(spec_key) {
        let kind = spec.get("kind").and_then(Value::as_str).and_then(parse_kind)?;
        let value = spec.get("value").and_then(Value::as_f64)?;
        return Some(PriceSpec { kind, value });
    }
    if let Some(points) = body.get(points_key).and_then(Value::as_f64) {
        return Some(PriceSpec {
            kind: StopSpecKind::Points,
            value: points,
        });
    }
    if let Some(price) = body.get(price_key).and_then(Value::as_f64) {
        return Some(PriceSpec {
            kind: StopSpecKind::Price,
            value: price,
        });
    }
    None
}

fn parse_kind(raw: &str) -> Option<StopSpecKind> {
    match raw.to_ascii_lowercase().as_str() {
        "points" => Some(StopSpecKind::Points),
        "dollars" => Some(StopSpecKind::Dollars),
        "price" => Some(StopSpecKind::Price),
        "percent" => Some(StopSpecKind::Percent),
        "atr" => Some(StopSpecKind::Atr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_direct_canonical_order() {
        let raw = json!({
            "id": "O1", "source": "B1", "instrument": "MES", "side": "BUY",
            "type": "MARKET", "quantity": 1, "accountId": "ACC1",
            "stopLossSpec": {"kind": "points", "value": 4.0},
            "takeProfitSpec": {"kind": "points", "value": 8.0},
        });
        let order = normalize(&raw, "B1").unwrap();
        assert_eq!(order.id, "O1");
        assert_eq!(order.quantity, 1);
        assert_eq!(order.stop_loss_spec.unwrap().value, 4.0);
    }

    #[test]
    fn normalizes_manual_order_shape() {
        let raw = json!({
            "type": "MANUAL_ORDER",
            "source": "manual-ui",
            "order": {"instrument": "MES", "action": "LONG", "qty": 2},
        });
        let order = normalize(&raw, "manual-ui").unwrap();
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.quantity, 2);
        assert_eq!(order.source_kind, crate::models::SourceKind::Manual);
    }

    #[test]
    fn explicit_source_kind_field_overrides_envelope_inference() {
        let raw = json!({
            "source": "strategy-7", "sourceKind": "strategy",
            "instrument": "MES", "side": "BUY", "type": "MARKET", "quantity": 1,
        });
        let order = normalize(&raw, "strategy-7").unwrap();
        assert_eq!(order.source_kind, crate::models::SourceKind::Strategy);
    }

    #[test]
    fn direct_canonical_order_defaults_to_external_source_kind() {
        let raw = json!({
            "id": "O1", "source": "B1", "instrument": "MES", "side": "BUY",
            "type": "MARKET", "quantity": 1, "accountId": "ACC1",
        });
        let order = normalize(&raw, "B1").unwrap();
        assert_eq!(order.source_kind, crate::models::SourceKind::External);
    }

    #[test]
    fn normalizes_legacy_place_order_shape() {
        let raw = json!({
            "type": "PLACE_ORDER",
            "source": "legacy-bot",
            "payload": {"symbol": "NQ", "side": "SELL", "quantity": 3, "stopLossPoints": 10.0},
        });
        let order = normalize(&raw, "legacy-bot").unwrap();
        assert_eq!(order.instrument, "NQ");
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.stop_loss_spec.unwrap().value, 10.0);
    }

    #[test]
    fn missing_instrument_is_malformed() {
        let raw = json!({"side": "BUY", "quantity": 1});
        let err = normalize(&raw, "B1").unwrap_err();
        assert_eq!(err.reason_tag(), "MALFORMED");
    }

    #[test]
    fn missing_quantity_is_malformed() {
        let raw = json!({"instrument": "MES", "side": "BUY"});
        assert!(normalize(&raw, "B1").is_err());
    }

    #[test]
    fn generated_id_is_prefixed_with_source() {
        let id = generate_order_id("B1");
        assert!(id.starts_with("B1_"));
    }
}
