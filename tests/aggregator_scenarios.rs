//! End-to-end scenario coverage for the order-routing core, exercising the
//! public building blocks directly (risk, queue, dispatcher, fills, locks)
//! the way the real aggregator wires them, without needing a live broker or
//! bus connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use order_aggregator::config::Config;
use order_aggregator::dispatcher::{self, DispatchOutcome, Dispatcher};
use order_aggregator::fill;
use order_aggregator::gateway::{GatewayClient, MockGatewayClient};
use order_aggregator::lock::{self, IdempotencyCache, OrderLockTable};
use order_aggregator::models::{
    Fill, Order, OrderStatus, OrderType, PriceSpec, RiskState, Side, SourceKind, StopSpecKind,
};
use order_aggregator::queue::PriorityQueue;
use order_aggregator::risk::RiskManager;

fn base_order(id: &str, order_type: OrderType) -> Order {
    Order {
        id: id.to_string(),
        source: "bot1".into(),
        source_kind: SourceKind::Bot,
        instrument: "MES".into(),
        side: Side::Buy,
        order_type,
        quantity: 1,
        limit_price: None,
        stop_price: None,
        stop_loss_spec: Some(PriceSpec {
            kind: StopSpecKind::Points,
            value: 4.0,
        }),
        take_profit_spec: Some(PriceSpec {
            kind: StopSpecKind::Points,
            value: 8.0,
        }),
        account_id: "ACC1".into(),
        urgency: false,
        metadata: HashMap::new(),
        submitted_at: std::time::Instant::now(),
    }
}

/// S1: a clean market order clears risk, dispatches, fills, and produces a
/// two-legged bracket.
#[tokio::test]
async fn s1_happy_path_bracket_order() {
    let config = Config::default();
    let risk_manager = RiskManager::new(config.clone());
    let mut risk_state = RiskState::new();

    let order = base_order("O1", OrderType::Market);
    let result = risk_manager.validate(&order, &mut risk_state);
    assert!(result.valid);

    let gateway = Arc::new(MockGatewayClient::new());
    let dispatcher = Dispatcher::new(gateway);
    let mut queue = PriorityQueue::new(config.queue_max_size, config.max_concurrent_in_flight, 1000.0, 100);
    queue.enqueue(order).unwrap();

    let (tracked, outcome) = dispatcher::drain_one(&mut queue, &dispatcher).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Sent { .. }));
    assert_eq!(tracked.status, OrderStatus::Sent);

    let bracket = dispatcher.take_bracket(&tracked.order.id).unwrap();
    let fill = Fill {
        order_id: tracked.order.id.clone(),
        instrument: "MES".into(),
        side: Side::Buy,
        fill_price: 4500.0,
        quantity: 1.0,
        timestamp: chrono::Utc::now(),
        account_id: "ACC1".into(),
        broker_id: tracked.broker_id.clone(),
    };
    let children = fill::materialize_bracket(&bracket, &fill, config.tick_size("MES"), config.default_dollar_per_point, config.min_risk_reward).unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.side == Side::Sell));
}

/// S2: an order exceeding the max daily loss limit is blocked with an
/// explicit violation, never silently dropped.
#[tokio::test]
async fn s2_risk_blocks_when_daily_loss_limit_breached() {
    let config = Config::default();
    let risk_manager = RiskManager::new(config.clone());
    let mut risk_state = RiskState::new();
    risk_state.daily_pnl = -config.max_daily_loss;

    let order = base_order("O2", OrderType::Market);
    let result = risk_manager.validate(&order, &mut risk_state);
    assert!(!result.valid);
    assert_eq!(risk_state.violation_history.len(), 1);
}

/// S3: market orders jump ahead of resting limit orders regardless of
/// submission order.
#[tokio::test]
async fn s3_queue_priority_favors_market_orders() {
    let config = Config::default();
    let mut queue = PriorityQueue::new(config.queue_max_size, config.max_concurrent_in_flight, 1000.0, 100);

    let mut limit_order = base_order("O-limit", OrderType::Limit);
    limit_order.limit_price = Some(4500.0);
    queue.enqueue(limit_order).unwrap();
    queue.enqueue(base_order("O-market", OrderType::Market)).unwrap();

    let first = queue.try_dequeue().unwrap();
    assert_eq!(first.order.id, "O-market");
}

/// S4: a dispatch failure is retried through the queue, and gives up once
/// the retry cap is hit.
#[tokio::test]
async fn s4_dispatch_failure_retries_then_gives_up() {
    let config = Config::default();
    let gateway = Arc::new(MockGatewayClient::failing());
    let dispatcher = Dispatcher::new(gateway);
    let mut queue = PriorityQueue::new(config.queue_max_size, config.max_concurrent_in_flight, 1000.0, 100);
    queue.enqueue(base_order("O4", OrderType::Market)).unwrap();

    let mut attempts = 0;
    loop {
        let Some((tracked, _outcome)) = dispatcher::drain_one(&mut queue, &dispatcher).await else {
            break;
        };
        attempts += 1;
        assert_eq!(tracked.status, OrderStatus::Failed);
        if attempts > 5 {
            panic!("retry loop did not converge");
        }
    }
    assert_eq!(attempts, 3, "should attempt exactly MAX_RETRIES times before giving up");
}

/// S5: a series of partial fills against the same parent each consume only
/// their own slice of the bracket, sized off the reported fill quantity, and
/// the bracket is only fully retired once its quantity is exhausted.
#[tokio::test]
async fn s5_partial_fill_uses_reported_quantity() {
    let gateway = Arc::new(MockGatewayClient::new());
    let dispatcher = Dispatcher::new(gateway);
    let mut order = base_order("O5", OrderType::Market);
    order.quantity = 5;
    let mut tracked = order_aggregator::models::TrackedOrder::new(order);
    dispatcher.dispatch(&mut tracked).await;

    let first_slice = dispatcher
        .consume_bracket("O5", 2.0)
        .expect("first partial fill finds a bracket");
    let first_fill = Fill {
        order_id: "O5".into(),
        instrument: "MES".into(),
        side: Side::Buy,
        fill_price: 4500.0,
        quantity: 2.0,
        timestamp: chrono::Utc::now(),
        account_id: "ACC1".into(),
        broker_id: None,
    };
    let first_children = fill::materialize_bracket(&first_slice, &first_fill, 0.25, 5.0, 1.0).unwrap();
    assert_eq!(first_children[0].quantity, 2);

    let second_slice = dispatcher
        .consume_bracket("O5", 3.0)
        .expect("second partial fill still finds a bracket for the remainder");
    let second_fill = Fill {
        order_id: "O5".into(),
        instrument: "MES".into(),
        side: Side::Buy,
        fill_price: 4505.0,
        quantity: 3.0,
        timestamp: chrono::Utc::now(),
        account_id: "ACC1".into(),
        broker_id: None,
    };
    let second_children = fill::materialize_bracket(&second_slice, &second_fill, 0.25, 5.0, 1.0).unwrap();
    assert_eq!(second_children[0].quantity, 3);

    assert!(
        dispatcher.consume_bracket("O5", 1.0).is_none(),
        "bracket must be exhausted once the full original quantity has been consumed"
    );
}

/// S6: two concurrent CLOSE_POSITION requests for the same order serialize
/// through the order lock, and a replayed request is answered from the
/// idempotency cache instead of re-executing the close.
#[tokio::test]
async fn s6_concurrent_close_requests_serialize_through_order_lock() {
    let table = OrderLockTable::new(Duration::from_secs(30));
    let cache = IdempotencyCache::new(100);

    let guard = table.try_acquire("O6").expect("first close acquires immediately");
    assert!(table.try_acquire("O6").is_none(), "second concurrent close must not acquire");
    table.release(guard);
    assert!(table.try_acquire("O6").is_some(), "close is free to proceed once released");

    let execute_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..3 {
        let execute_count = execute_count.clone();
        let result = lock::execute_once(&cache, "O6", "close", || async move {
            execute_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(serde_json::json!({"success": true, "brokerId": "MOCK-CLOSE-1"}))
        })
        .await
        .unwrap();
        assert_eq!(result["brokerId"], "MOCK-CLOSE-1");
    }
    assert_eq!(
        execute_count.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "a replayed close request must be answered from cache, not re-executed"
    );
}

#[tokio::test]
async fn mock_gateway_balance_defaults_when_unset() {
    let gateway = MockGatewayClient::new();
    assert_eq!(gateway.get_balance("ACC-unset").await.unwrap(), 10_000.0);
}
