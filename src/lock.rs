//! Order mutex and idempotency cache (§4.8), shaped after
//! `middleware::rate_limit`'s sharded `HashMap` under a `parking_lot::Mutex`:
//! here keyed by order id instead of source IP, holding a lease instead of a
//! request count.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{AggregatorError, Result};
use crate::models::Lock;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive per-order-id lock table with TTL-based expiry, so a crashed
/// holder never wedges an order permanently (§4.8).
#[derive(Clone)]
pub struct OrderLockTable {
    locks: Arc<Mutex<HashMap<String, Lock>>>,
    ttl: Duration,
}

/// A held lock; releases on drop is intentionally not implemented so
/// release always goes through `OrderLockTable::release`, which can log and
/// verify lock-id ownership before removing the entry.
pub struct LockGuard {
    pub key: String,
    pub lock_id: uuid::Uuid,
}

impl OrderLockTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Attempts to acquire immediately; steals an expired lock rather than
    /// blocking on it (§4.8).
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(existing) = locks.get(key) {
            if !existing.is_expired(now) {
                return None;
            }
        }
        let lock_id = uuid::Uuid::new_v4();
        locks.insert(
            key.to_string(),
            Lock {
                lock_id,
                locked_at: now,
                ttl: self.ttl,
            },
        );
        Some(LockGuard {
            key: key.to_string(),
            lock_id,
        })
    }

    /// Polls every 10ms until the lock is free or `timeout` elapses (§4.8).
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_acquire(key) {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(AggregatorError::LockTimeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Releases only if `guard` still owns the lock (it may have been
    /// stolen after expiry).
    pub fn release(&self, guard: LockGuard) {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&guard.key) {
            if existing.lock_id == guard.lock_id {
                locks.remove(&guard.key);
                return;
            }
        }
        warn!(key = %guard.key, "release on a lock already reassigned, ignoring");
    }

    /// Background sweeper; call on an interval to drop stale entries so the
    /// table doesn't grow unbounded under crash-heavy workloads.
    pub fn sweep_expired(&self) {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        locks.retain(|_, lock| !lock.is_expired(now));
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn idempotency_key(order_id: &str, operation: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(order_id.as_bytes());
    hasher.update(b":");
    hasher.update(operation.as_bytes());
    hex::encode(hasher.finalize())
}

/// Bounded, LRU-evicted cache of `(orderId, operation)` results so a
/// duplicate command is answered from cache instead of re-executed (§4.8).
pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, serde_json::Value>>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl IdempotencyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn get(&self, order_id: &str, operation: &str) -> Option<serde_json::Value> {
        let key = idempotency_key(order_id, operation);
        self.entries.lock().get(&key).cloned()
    }

    pub fn put(&self, order_id: &str, operation: &str, result: serde_json::Value) {
        let key = idempotency_key(order_id, operation);
        let mut entries = self.entries.lock();
        let mut order = self.order.lock();
        if !entries.contains_key(&key) {
            order.push_back(key.clone());
        }
        entries.insert(key, result);
        while entries.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Runs `action` at most once per `(orderId, operation)` pair, returning the
/// cached result on replay (§4.8 `executeOnce`).
pub async fn execute_once<F, Fut>(
    cache: &IdempotencyCache,
    order_id: &str,
    operation: &str,
    action: F,
) -> Result<serde_json::Value>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<serde_json::Value>>,
{
    if let Some(cached) = cache.get(order_id, operation) {
        return Ok(cached);
    }
    let result = action().await?;
    cache.put(order_id, operation, result.clone());
    Ok(result)
}
