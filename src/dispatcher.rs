//! Dispatcher / gateway adapter (§4.5): drains the priority queue, submits
//! to the broker gateway, and parks a `PendingBracket` before the order
//! leaves for the wire when it carries stop-loss/take-profit specs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::gateway::GatewayClient;
use crate::models::{OrderId, OrderStatus, PendingBracket, TrackedOrder};
use crate::queue::{self, PriorityQueue};

/// Outcome of one dispatch attempt, used by the caller to decide whether to
/// retry through the queue.
pub enum DispatchOutcome {
    Sent { broker_id: String },
    Failed { reason: String },
}

pub struct Dispatcher<G: GatewayClient> {
    gateway: Arc<G>,
    pending_brackets: Arc<RwLock<HashMap<OrderId, PendingBracket>>>,
}

impl<G: GatewayClient> Dispatcher<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            pending_brackets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn pending_brackets(&self) -> Arc<RwLock<HashMap<OrderId, PendingBracket>>> {
        self.pending_brackets.clone()
    }

    /// Submits `tracked`'s order to the gateway, transitioning it to SENT on
    /// success or FAILED on error, and parks a bracket first when the order
    /// carries stop/take-profit specs (§4.5, §4.7).
    pub async fn dispatch(&self, tracked: &mut TrackedOrder) -> DispatchOutcome {
        if tracked.order.stop_loss_spec.is_some() || tracked.order.take_profit_spec.is_some() {
            let bracket = PendingBracket {
                parent_order_id: tracked.order.id.clone(),
                instrument: tracked.order.instrument.clone(),
                side: tracked.order.side,
                account_id: tracked.order.account_id.clone(),
                source: tracked.order.source.clone(),
                source_kind: tracked.order.source_kind,
                original_quantity: tracked.order.quantity,
                remaining_quantity: tracked.order.quantity,
                stop_loss_spec: tracked.order.stop_loss_spec,
                take_profit_spec: tracked.order.take_profit_spec,
                created_at: chrono::Utc::now(),
            };
            self.pending_brackets
                .write()
                .insert(tracked.order.id.clone(), bracket);
        }

        match self.gateway.submit_order(&tracked.order).await {
            Ok(ack) => {
                tracked.broker_id = Some(ack.broker_id.clone());
                let _ = tracked.transition(OrderStatus::Sent);
                info!(order_id = %tracked.order.id, broker_id = %ack.broker_id, "order dispatched");
                DispatchOutcome::Sent {
                    broker_id: ack.broker_id,
                }
            }
            Err(err) => {
                tracked.error = Some(err.to_string());
                let _ = tracked.transition(OrderStatus::Failed);
                self.pending_brackets.write().remove(&tracked.order.id);
                warn!(order_id = %tracked.order.id, error = %err, "dispatch failed");
                DispatchOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Unconditionally removes and returns the bracket parked for
    /// `parent_order_id`, if any — for cancelling a pending bracket outright
    /// (e.g. a manual close), not for per-fill consumption (§4.7, §4.8).
    pub fn take_bracket(&self, parent_order_id: &str) -> Option<PendingBracket> {
        self.pending_brackets.write().remove(parent_order_id)
    }

    /// Consumes just enough of a parked bracket's remaining quantity to
    /// cover one fill, returning a bracket slice sized to that fill. The
    /// parked bracket itself is only removed once its remaining quantity is
    /// fully consumed, so a second (or third) partial fill against the same
    /// parent still finds a bracket to materialize against (§4.7, S5).
    pub fn consume_bracket(&self, parent_order_id: &str, fill_quantity: f64) -> Option<PendingBracket> {
        let mut brackets = self.pending_brackets.write();
        let remaining = brackets.get(parent_order_id)?.remaining_quantity;
        if remaining == 0 {
            return None;
        }
        let consume_qty = if fill_quantity > 0.0 {
            (fill_quantity.round() as u32).clamp(1, remaining)
        } else {
            remaining
        };

        let mut slice = brackets.get(parent_order_id).unwrap().clone();
        slice.original_quantity = consume_qty;

        let bracket = brackets.get_mut(parent_order_id).unwrap();
        bracket.remaining_quantity -= consume_qty;
        if bracket.remaining_quantity == 0 {
            brackets.remove(parent_order_id);
        }

        Some(slice)
    }
}

/// Drains one order from `queue` if throttling and the in-flight ceiling
/// both allow it, retrying up to the policy's cap on failure (§4.4, §4.5).
pub async fn drain_one<G: GatewayClient>(
    queue: &mut PriorityQueue,
    dispatcher: &Dispatcher<G>,
) -> Option<(TrackedOrder, DispatchOutcome)> {
    let queued = queue.try_dequeue()?;
    let wait_seconds = queued.order.submitted_at.elapsed().as_secs_f64();
    queue.record_wait(wait_seconds);

    let mut tracked = TrackedOrder::new(queued.order);
    let _ = tracked.transition(OrderStatus::Processing);

    let start = std::time::Instant::now();
    let outcome = dispatcher.dispatch(&mut tracked).await;
    queue.record_processing(start.elapsed().as_secs_f64());
    queue.release_in_flight();

    if let DispatchOutcome::Failed { .. } = &outcome {
        if let Some(retry_order) = queue::should_retry(&tracked.order) {
            info!(order_id = %retry_order.id, retry_count = retry_order.retry_count(), "re-enqueuing failed dispatch");
            let _ = queue.enqueue(retry_order);
        }
    }

    Some((tracked, outcome))
}
