//! Top-level wiring (§5): one task owns the mutable risk/queue/bracket
//! state and serially drains three mpsc channels (intake, fills, control);
//! everything else is stateless and spawned independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{self, channels, Bus, BusMessage};
use crate::config::Config;
use crate::control::{ControlCommand, RunState};
use crate::dispatcher::{self, DispatchOutcome, Dispatcher};
use crate::fill;
use crate::gateway::GatewayClient;
use crate::health::{HealthMonitor, HealthThresholds};
use crate::intake;
use crate::lock::{self, IdempotencyCache, OrderLockTable};
use crate::models::{Fill, Order, OrderStatus, OrderType, Position, RiskState, Side, SourceKind};
use crate::queue::PriorityQueue;
use crate::registry::SourceRegistry;
use crate::risk::RiskManager;

/// The RPC surface carried on `aggregator:requests` (§4.1, §6): account and
/// contract lookups, statistics, and position close-outs.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
enum AggregatorRequest {
    GetAccounts { request_id: String, account_id: String },
    GetActiveContracts { request_id: String, account_id: String },
    ClosePosition { request_id: String, account_id: String, instrument: String },
    GetStatistics { request_id: String },
}

pub struct Aggregator<B: Bus + 'static, G: GatewayClient + 'static> {
    pub config: Arc<Config>,
    pub bus: Arc<B>,
    pub gateway: Arc<G>,
    pub registry: SourceRegistry,
    pub health: Arc<HealthMonitor>,
    pub run_state: RunState,
    pub lock_table: OrderLockTable,
    pub idempotency: Arc<IdempotencyCache>,
    pub queue_depth: Arc<parking_lot::RwLock<usize>>,
}

impl<B: Bus + 'static, G: GatewayClient + 'static> Aggregator<B, G> {
    pub fn new(config: Config, bus: Arc<B>, gateway: Arc<G>) -> Self {
        let config = Arc::new(config);
        Self {
            registry: SourceRegistry::new(config.auto_register_unknown_sources),
            health: HealthMonitor::new(HealthThresholds::default()),
            run_state: RunState::new(),
            lock_table: OrderLockTable::new(config.lock_ttl),
            idempotency: Arc::new(IdempotencyCache::new(config.idempotency_cache_size)),
            queue_depth: Arc::new(parking_lot::RwLock::new(0)),
            config,
            bus,
            gateway,
        }
    }

    /// Spawns every long-running task and returns once the control channel
    /// has requested shutdown.
    pub async fn run(self) {
        let orders_rx = self.bus.subscribe(channels::ORDERS_IN).await;
        let fills_rx = self.bus.subscribe(channels::FILLS_IN).await;
        let requests_rx = self.bus.subscribe(channels::REQUESTS_IN).await;
        let control_rx = self.bus.subscribe(channels::CONTROL_IN).await;

        self.spawn_lock_sweeper();
        self.spawn_control_listener(control_rx);
        self.run_core_loop(orders_rx, fills_rx, requests_rx).await;
    }

    fn spawn_lock_sweeper(&self) {
        let lock_table = self.lock_table.clone();
        let interval = self.config.lock_cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                lock_table.sweep_expired();
            }
        });
    }

    fn spawn_control_listener(&self, mut control_rx: mpsc::Receiver<BusMessage>) {
        let run_state = self.run_state.clone();
        tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                match serde_json::from_value::<ControlCommand>(msg.payload) {
                    Ok(command) => run_state.apply(command),
                    Err(err) => warn!(error = %err, "malformed control command, ignored"),
                }
            }
        });
    }

    /// Owns `RiskState`, the priority queue, and the pending-bracket table
    /// for the lifetime of the process; every mutation happens here, in
    /// series, so no lock is needed around them (§5).
    async fn run_core_loop(
        &self,
        mut orders_rx: mpsc::Receiver<BusMessage>,
        mut fills_rx: mpsc::Receiver<BusMessage>,
        mut requests_rx: mpsc::Receiver<BusMessage>,
    ) {
        let mut risk_state = RiskState::new();
        let mut positions: HashMap<String, Position> = HashMap::new();
        let risk_manager = RiskManager::new((*self.config).clone());
        let dispatcher = Dispatcher::new(self.gateway.clone());
        let mut queue = PriorityQueue::new(
            self.config.queue_max_size,
            self.config.max_concurrent_in_flight,
            self.config.max_orders_per_second,
            self.config.burst_limit,
        );

        let mut dispatch_ticker = tokio::time::interval(Duration::from_millis(5));

        loop {
            if self.run_state.is_shutting_down() {
                info!("core loop shutting down");
                break;
            }

            tokio::select! {
                Some(msg) = orders_rx.recv() => {
                    self.handle_inbound_order(msg, &risk_manager, &mut risk_state, &mut queue);
                }
                Some(msg) = fills_rx.recv() => {
                    self.handle_inbound_fill(msg, &dispatcher, &mut positions, &mut risk_state, &mut queue).await;
                }
                Some(msg) = requests_rx.recv() => {
                    self.handle_inbound_request(msg).await;
                }
                _ = dispatch_ticker.tick() => {
                    if !self.run_state.is_paused() {
                        self.drain_and_publish(&mut queue, &dispatcher).await;
                    }
                    *self.queue_depth.write() = queue.len();
                    self.health.evaluate_alerts(
                        queue.len(),
                        queue.p95_processing(),
                        risk_state.violation_history.len() as f64,
                    );
                }
            }
        }
    }

    fn handle_inbound_order(
        &self,
        msg: BusMessage,
        risk_manager: &RiskManager,
        risk_state: &mut RiskState,
        queue: &mut PriorityQueue,
    ) {
        self.health.record_order_received();

        let order = match intake::normalize(&msg.payload, "unknown") {
            Ok(order) => order,
            Err(err) => {
                warn!(error = %err, "rejected malformed order on intake");
                self.health.record_order_rejected();
                return;
            }
        };

        if let Err(err) = self
            .registry
            .validate_and_touch(&order.source, order.source_kind, &msg.payload)
        {
            warn!(error = %err, source = %order.source, "rejected order from unregistered/invalid source");
            self.health.record_order_rejected();
            return;
        }

        let result = risk_manager.validate(&order, risk_state);
        if !result.valid {
            self.health.record_order_rejected();
            for violation in &result.violations {
                self.health.record_violation();
                warn!(order_id = %order.id, kind = ?violation.kind, "risk violation");
            }
            self.registry.record_outcome(&order.source, false);
            if !self.config.allow_dispatch_after_risk_rejection {
                return;
            }
            warn!(order_id = %order.id, "dispatching despite risk rejection per legacy-compat configuration");
        }

        match queue.enqueue(order.clone()) {
            Ok(priority) => {
                self.health.record_order_accepted();
                self.registry.record_outcome(&order.source, true);
                info!(order_id = %order.id, priority, "order enqueued");
            }
            Err(crate::queue::AdmissionError::QueueFull) => {
                self.health.record_order_rejected();
                warn!(order_id = %order.id, "queue full, order rejected");
            }
        }
    }

    async fn handle_inbound_fill(
        &self,
        msg: BusMessage,
        dispatcher: &Dispatcher<G>,
        positions: &mut HashMap<String, Position>,
        risk_state: &mut RiskState,
        queue: &mut PriorityQueue,
    ) {
        let fill: Fill = match serde_json::from_value(msg.payload) {
            Ok(fill) => fill,
            Err(err) => {
                warn!(error = %err, "malformed fill payload, dropped");
                return;
            }
        };

        self.health.record_fill();

        let Some(bracket) = dispatcher.consume_bracket(&fill.order_id, fill.quantity) else {
            warn!(order_id = %fill.order_id, "fill has no associated bracket, updating position only");
            self.apply_fill_to_position(&fill, positions, risk_state);
            bus::publish(&*self.bus, channels::FILL_ENHANCED_OUT, &fill).await;
            return;
        };

        self.apply_fill_to_position(&fill, positions, risk_state);

        match fill::materialize_bracket(
            &bracket,
            &fill,
            self.config.tick_size(&bracket.instrument),
            self.config.default_dollar_per_point,
            self.config.min_risk_reward,
        ) {
            Ok(children) => {
                for child in children {
                    if let Err(err) = queue.enqueue(child.clone()) {
                        error!(order_id = %child.id, ?err, "failed to enqueue bracket child, queue full");
                    }
                }
            }
            Err(err) => error!(order_id = %fill.order_id, %err, "failed to materialize bracket"),
        }

        bus::publish(&*self.bus, channels::FILL_ENHANCED_OUT, &fill).await;
    }

    /// Routes one `aggregator:requests` RPC (§4.1, §6) through to its
    /// handler, publishing the response on the request's own response
    /// channel.
    async fn handle_inbound_request(&self, msg: BusMessage) {
        let request: AggregatorRequest = match serde_json::from_value(msg.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "malformed request on requests-in, dropped");
                return;
            }
        };

        match request {
            AggregatorRequest::GetAccounts { request_id, account_id } => {
                let balance = self.gateway.get_balance(&account_id).await.ok();
                self.respond(&request_id, serde_json::json!({"accountId": account_id, "balance": balance}))
                    .await;
            }
            AggregatorRequest::GetActiveContracts { request_id, account_id } => {
                let positions = self.gateway.get_positions(&account_id).await.unwrap_or_default();
                self.respond(
                    &request_id,
                    serde_json::json!({"accountId": account_id, "positions": positions}),
                )
                .await;
            }
            AggregatorRequest::GetStatistics { request_id } => {
                let sources = self.registry.statistics();
                self.respond(&request_id, serde_json::json!({"sources": sources})).await;
            }
            AggregatorRequest::ClosePosition { request_id, account_id, instrument } => {
                self.handle_close_position(request_id, account_id, instrument).await;
            }
        }
    }

    async fn respond(&self, request_id: &str, payload: serde_json::Value) {
        bus::publish(&*self.bus, &channels::bot_close_response_for(request_id), &payload).await;
    }

    /// Closes an open position by submitting an opposite-side market order
    /// sized to flatten it, serialized through the per-order lock and
    /// deduplicated via the idempotency cache so a retried CLOSE_POSITION
    /// request doesn't double-flatten (§4.8).
    async fn handle_close_position(&self, request_id: String, account_id: String, instrument: String) {
        let lock_key = format!("{account_id}:{instrument}");
        let guard = match self.lock_table.acquire(&lock_key, self.config.lock_ttl).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(error = %err, %lock_key, "close-position request timed out waiting for the position lock");
                self.respond(
                    &request_id,
                    serde_json::json!({"success": false, "reason": err.reason_tag()}),
                )
                .await;
                return;
            }
        };

        let gateway = self.gateway.clone();
        let account_for_close = account_id.clone();
        let instrument_for_close = instrument.clone();
        let result = lock::execute_once(&self.idempotency, &lock_key, "close", || async move {
            let positions = gateway.get_positions(&account_for_close).await?;
            let Some(position) = positions.into_iter().find(|p| p.instrument == instrument_for_close) else {
                return Ok(serde_json::json!({"success": true, "message": "no open position"}));
            };
            if position.net_quantity.abs() < f64::EPSILON {
                return Ok(serde_json::json!({"success": true, "message": "already flat"}));
            }

            let closing_side = if position.net_quantity > 0.0 { Side::Sell } else { Side::Buy };
            let closing_order = Order {
                id: intake::generate_order_id(&format!("close-{account_for_close}")),
                source: "position-close".to_string(),
                source_kind: SourceKind::Api,
                instrument: instrument_for_close.clone(),
                side: closing_side,
                order_type: OrderType::Market,
                quantity: position.net_quantity.abs().round() as u32,
                limit_price: None,
                stop_price: None,
                stop_loss_spec: None,
                take_profit_spec: None,
                account_id: account_for_close.clone(),
                urgency: true,
                metadata: HashMap::new(),
                submitted_at: std::time::Instant::now(),
            };
            let ack = gateway.submit_order(&closing_order).await?;
            Ok(serde_json::json!({"success": true, "brokerId": ack.broker_id}))
        })
        .await;

        self.lock_table.release(guard);

        match result {
            Ok(payload) => self.respond(&request_id, payload).await,
            Err(err) => {
                self.respond(&request_id, serde_json::json!({"success": false, "reason": err.reason_tag()}))
                    .await;
            }
        }
    }

    fn apply_fill_to_position(&self, incoming: &Fill, positions: &mut HashMap<String, Position>, risk_state: &mut RiskState) {
        let key = Position::key(&incoming.instrument, "aggregate");
        let current = positions
            .entry(key.clone())
            .or_insert_with(|| Position::flat(incoming.instrument.clone(), "aggregate".to_string()));

        let outcome = fill::apply_fill(current, incoming, &self.config);
        *current = outcome.position.clone();
        risk_state.daily_pnl += outcome.realized_pnl_delta;
        if outcome.realized_pnl_delta < 0.0 {
            risk_state.daily_loss_count += 1;
        }
        risk_state.open_positions.insert(key, outcome.position);
    }

    async fn drain_and_publish(&self, queue: &mut PriorityQueue, dispatcher: &Dispatcher<G>) {
        if let Some((tracked, outcome)) = dispatcher::drain_one(queue, dispatcher).await {
            match outcome {
                DispatchOutcome::Sent { broker_id } => {
                    bus::publish(
                        &*self.bus,
                        &channels::positions_out_for(&tracked.order.account_id),
                        &serde_json::json!({"orderId": tracked.order.id, "status": "SENT", "brokerId": broker_id}),
                    )
                    .await;
                }
                DispatchOutcome::Failed { reason } => {
                    if tracked.status == OrderStatus::Failed {
                        bus::publish(
                            &*self.bus,
                            channels::ALERTS_OUT,
                            &serde_json::json!({"orderId": tracked.order.id, "reason": reason}),
                        )
                        .await;
                    }
                }
            }
        }
    }
}
