//! Priority queue and throttle (§4.4): three priority bands, token-bucket
//! pacing, and a bounded in-flight ceiling in front of the dispatcher.

pub mod throttle;

use std::collections::VecDeque;

use crate::models::{Order, OrderType, SourceKind};
use throttle::{RollingWindow, TokenBucket};

const MAX_RETRIES: u8 = 3;
const WAIT_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Band {
    Low,
    Medium,
    High,
}

impl Band {
    fn from_priority(priority: u8) -> Band {
        match priority {
            8..=10 => Band::High,
            5..=7 => Band::Medium,
            _ => Band::Low,
        }
    }
}

/// Derives a 0-10 priority score for `order` per the §4.4 table: base 5,
/// order-type bump, +2 urgency, +1 manual source, +1 retry, capped at 10.
pub fn derive_priority(order: &Order) -> u8 {
    let mut priority: i32 = match order.order_type {
        OrderType::Market => 10,
        OrderType::StopLoss => 9,
        OrderType::Modify | OrderType::Cancel => 8,
        OrderType::TakeProfit => 7,
        OrderType::Limit | OrderType::Stop => 5,
    };

    if order.urgency {
        priority += 2;
    }
    if order.source_kind == SourceKind::Manual {
        priority += 1;
    }
    if order.retry_count() > 0 {
        priority += 1;
    }

    priority.clamp(0, 10) as u8
}

pub struct QueuedOrder {
    pub order: Order,
    pub priority: u8,
}

/// Rejection reason when admission fails (§4.4, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    QueueFull,
}

/// Three FIFO bands (high/medium/low), a token-bucket throttle gating
/// dequeues, and a concurrency ceiling on in-flight dispatches.
pub struct PriorityQueue {
    high: VecDeque<QueuedOrder>,
    medium: VecDeque<QueuedOrder>,
    low: VecDeque<QueuedOrder>,
    max_size: usize,
    in_flight: usize,
    max_concurrent_in_flight: usize,
    bucket: TokenBucket,
    wait_window: RollingWindow,
    processing_window: RollingWindow,
}

impl PriorityQueue {
    pub fn new(max_size: usize, max_concurrent_in_flight: usize, rate_per_sec: f64, burst_limit: u32) -> Self {
        Self {
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
            max_size,
            in_flight: 0,
            max_concurrent_in_flight,
            bucket: TokenBucket::new(rate_per_sec, burst_limit),
            wait_window: RollingWindow::new(WAIT_WINDOW),
            processing_window: RollingWindow::new(WAIT_WINDOW),
        }
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects admission with `QueueFull` once the combined depth across all
    /// three bands reaches `max_size` (§4.4, §7).
    pub fn enqueue(&mut self, order: Order) -> Result<u8, AdmissionError> {
        if self.len() >= self.max_size {
            return Err(AdmissionError::QueueFull);
        }
        let priority = derive_priority(&order);
        let queued = QueuedOrder { order, priority };
        match Band::from_priority(priority) {
            Band::High => self.high.push_back(queued),
            Band::Medium => self.medium.push_back(queued),
            Band::Low => self.low.push_back(queued),
        }
        Ok(priority)
    }

    /// Pops the head of the highest non-empty band, gated by both the
    /// token bucket and the in-flight ceiling. Returns `None` if neither
    /// condition is currently satisfied.
    pub fn try_dequeue(&mut self) -> Option<QueuedOrder> {
        if self.in_flight >= self.max_concurrent_in_flight {
            return None;
        }
        if !self.bucket.try_take() {
            return None;
        }
        let item = self
            .high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())?;
        self.in_flight += 1;
        Some(item)
    }

    /// Records that a previously dequeued order finished (dispatched,
    /// failed, or rejected), freeing its in-flight slot.
    pub fn release_in_flight(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn record_wait(&mut self, seconds: f64) {
        self.wait_window.push(seconds);
    }

    pub fn record_processing(&mut self, seconds: f64) {
        self.processing_window.push(seconds);
    }

    pub fn average_wait(&self) -> f64 {
        self.wait_window.average()
    }

    pub fn average_processing(&self) -> f64 {
        self.processing_window.average()
    }

    pub fn p95_processing(&self) -> f64 {
        self.processing_window.percentile(0.95)
    }
}

/// Decides whether a failed dispatch should be retried, bumping the order's
/// retry counter, or should be given up on after the third attempt (§4.4, §5).
pub fn should_retry(order: &Order) -> Option<Order> {
    let attempts = order.retry_count();
    if attempts + 1 >= MAX_RETRIES {
        None
    } else {
        Some(order.clone().with_retry_count(attempts + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn order_with_type(order_type: OrderType) -> Order {
        Order {
            id: "O1".into(),
            source: "bot1".into(),
            source_kind: SourceKind::Bot,
            instrument: "MES".into(),
            side: crate::models::Side::Buy,
            order_type,
            quantity: 1,
            limit_price: Some(1.0),
            stop_price: Some(1.0),
            stop_loss_spec: None,
            take_profit_spec: None,
            account_id: "ACC1".into(),
            urgency: false,
            metadata: HashMap::new(),
            submitted_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn market_orders_get_top_priority() {
        assert_eq!(derive_priority(&order_with_type(OrderType::Market)), 10);
    }

    #[test]
    fn urgency_and_retry_bump_priority_without_exceeding_cap() {
        let mut order = order_with_type(OrderType::Market);
        order.urgency = true;
        order = order.with_retry_count(1);
        assert_eq!(derive_priority(&order), 10);
    }

    #[test]
    fn manual_source_kind_bumps_priority() {
        let mut order = order_with_type(OrderType::Limit);
        order.source_kind = SourceKind::Manual;
        assert_eq!(derive_priority(&order), 6);
    }

    #[test]
    fn queue_full_rejects_admission() {
        let mut queue = PriorityQueue::new(1, 10, 1000.0, 100);
        queue.enqueue(order_with_type(OrderType::Market)).unwrap();
        let err = queue.enqueue(order_with_type(OrderType::Limit)).unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull);
    }

    #[test]
    fn high_band_dequeues_before_lower_bands() {
        let mut queue = PriorityQueue::new(10, 10, 1000.0, 100);
        queue.enqueue(order_with_type(OrderType::Limit)).unwrap();
        queue.enqueue(order_with_type(OrderType::Market)).unwrap();
        let first = queue.try_dequeue().unwrap();
        assert_eq!(first.order.order_type, OrderType::Market);
    }

    #[test]
    fn in_flight_ceiling_blocks_further_dequeues() {
        let mut queue = PriorityQueue::new(10, 1, 1000.0, 100);
        queue.enqueue(order_with_type(OrderType::Market)).unwrap();
        queue.enqueue(order_with_type(OrderType::Market)).unwrap();
        assert!(queue.try_dequeue().is_some());
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn retries_give_up_after_third_attempt() {
        let mut order = order_with_type(OrderType::Market);
        order = order.with_retry_count(2);
        assert!(should_retry(&order).is_none());
    }
}
