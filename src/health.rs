//! Health and metrics snapshot (§4.10): monotonic counters, gauges, and
//! 1s/60s/5m rolling windows, exported both as a JSON snapshot for
//! `GET /health` and as Prometheus gauges when the exporter is installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::queue::throttle::RollingWindow;

const SHORT_WINDOW: usize = 10;
const MEDIUM_WINDOW: usize = 60;
const LONG_WINDOW: usize = 300;

#[derive(Default)]
struct Counters {
    orders_received: AtomicU64,
    orders_accepted: AtomicU64,
    orders_rejected: AtomicU64,
    fills_processed: AtomicU64,
    violations_total: AtomicU64,
}

struct Windows {
    processing_1s: RollingWindow,
    processing_60s: RollingWindow,
    processing_5m: RollingWindow,
}

/// Tracks the last threshold state per alert so transitions only fire once
/// (§4.10: "alert once per transition, not once per tick").
#[derive(Default)]
struct AlertState {
    queue_depth_breached: bool,
    p95_breached: bool,
    violation_rate_breached: bool,
}

pub struct HealthThresholds {
    pub queue_depth: usize,
    pub p95_processing_seconds: f64,
    pub violation_rate_per_minute: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_depth: 800,
            p95_processing_seconds: 2.0,
            violation_rate_per_minute: 20.0,
        }
    }
}

#[derive(Serialize)]
pub struct HealthSnapshot {
    pub orders_received: u64,
    pub orders_accepted: u64,
    pub orders_rejected: u64,
    pub fills_processed: u64,
    pub violations_total: u64,
    pub queue_depth: usize,
    pub avg_processing_seconds_1s: f64,
    pub avg_processing_seconds_60s: f64,
    pub avg_processing_seconds_5m: f64,
    pub uptime_seconds: u64,
}

pub struct HealthMonitor {
    counters: Counters,
    windows: RwLock<Windows>,
    alerts: RwLock<AlertState>,
    thresholds: HealthThresholds,
    started_at: std::time::Instant,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Arc<Self> {
        Arc::new(Self {
            counters: Counters::default(),
            windows: RwLock::new(Windows {
                processing_1s: RollingWindow::new(SHORT_WINDOW),
                processing_60s: RollingWindow::new(MEDIUM_WINDOW),
                processing_5m: RollingWindow::new(LONG_WINDOW),
            }),
            alerts: RwLock::new(AlertState::default()),
            thresholds,
            started_at: std::time::Instant::now(),
        })
    }

    pub fn record_order_received(&self) {
        self.counters.orders_received.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("aggregator_orders_received_total");
    }

    pub fn record_order_accepted(&self) {
        self.counters.orders_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("aggregator_orders_accepted_total");
    }

    pub fn record_order_rejected(&self) {
        self.counters.orders_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("aggregator_orders_rejected_total");
    }

    pub fn record_fill(&self) {
        self.counters.fills_processed.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("aggregator_fills_processed_total");
    }

    pub fn record_violation(&self) {
        self.counters.violations_total.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("aggregator_violations_total");
    }

    pub fn record_processing_time(&self, seconds: f64) {
        let mut windows = self.windows.write();
        windows.processing_1s.push(seconds);
        windows.processing_60s.push(seconds);
        windows.processing_5m.push(seconds);
        metrics::histogram!("aggregator_processing_seconds", seconds);
    }

    /// Checks queue depth and p95 processing time against configured
    /// thresholds, logging a WARN only on the rising edge of a breach.
    pub fn evaluate_alerts(&self, queue_depth: usize, p95_processing: f64, violations_per_minute: f64) {
        let mut alerts = self.alerts.write();

        let queue_over = queue_depth >= self.thresholds.queue_depth;
        if queue_over && !alerts.queue_depth_breached {
            warn!(queue_depth, threshold = self.thresholds.queue_depth, "queue depth threshold breached");
        }
        alerts.queue_depth_breached = queue_over;

        let p95_over = p95_processing >= self.thresholds.p95_processing_seconds;
        if p95_over && !alerts.p95_breached {
            warn!(p95_processing, threshold = self.thresholds.p95_processing_seconds, "p95 processing time threshold breached");
        }
        alerts.p95_breached = p95_over;

        let violation_over = violations_per_minute >= self.thresholds.violation_rate_per_minute;
        if violation_over && !alerts.violation_rate_breached {
            warn!(violations_per_minute, threshold = self.thresholds.violation_rate_per_minute, "violation rate threshold breached");
        }
        alerts.violation_rate_breached = violation_over;
    }

    pub fn snapshot(&self, queue_depth: usize) -> HealthSnapshot {
        let windows = self.windows.read();
        HealthSnapshot {
            orders_received: self.counters.orders_received.load(Ordering::Relaxed),
            orders_accepted: self.counters.orders_accepted.load(Ordering::Relaxed),
            orders_rejected: self.counters.orders_rejected.load(Ordering::Relaxed),
            fills_processed: self.counters.fills_processed.load(Ordering::Relaxed),
            violations_total: self.counters.violations_total.load(Ordering::Relaxed),
            queue_depth,
            avg_processing_seconds_1s: windows.processing_1s.average(),
            avg_processing_seconds_60s: windows.processing_60s.average(),
            avg_processing_seconds_5m: windows.processing_5m.average(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Installs the Prometheus exporter on `addr`, mirroring how this codebase
/// wires `metrics-exporter-prometheus` at process start.
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alerts_fire_once_per_rising_edge() {
        let monitor = HealthMonitor::new(HealthThresholds {
            queue_depth: 5,
            p95_processing_seconds: 100.0,
            violation_rate_per_minute: 100.0,
        });
        monitor.evaluate_alerts(10, 0.0, 0.0);
        assert!(monitor.alerts.read().queue_depth_breached);
        monitor.evaluate_alerts(1, 0.0, 0.0);
        assert!(!monitor.alerts.read().queue_depth_breached);
    }

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.record_order_received();
        monitor.record_order_accepted();
        let snapshot = monitor.snapshot(0);
        assert_eq!(snapshot.orders_received, 1);
        assert_eq!(snapshot.orders_accepted, 1);
    }
}
