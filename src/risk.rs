//! Risk Manager (§4.3): order validation, daily P&L gates, position and
//! exposure accounting. Rules run sequentially and collect *all* violations
//! before returning — never short-circuit.

use chrono::{Timelike, Utc};

use crate::config::Config;
use crate::models::{Order, RiskState, Severity, Side, ViolationKind, RiskViolation};

#[derive(Debug, Clone)]
pub struct RiskCheckResult {
    pub valid: bool,
    pub violations: Vec<RiskViolation>,
}

/// Stateless rule engine; the mutable bits it reads/writes (`RiskState`) are
/// owned by the caller's single risk+enqueue task (§5).
pub struct RiskManager {
    config: Config,
}

impl RiskManager {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs every rule in §4.3 against `order`, never short-circuiting, and
    /// records any violations into `state.violation_history`.
    pub fn validate(&self, order: &Order, state: &mut RiskState) -> RiskCheckResult {
        let mut violations = Vec::new();

        if order.quantity < self.config.min_order_size {
            violations.push(RiskViolation {
                kind: ViolationKind::MinOrderSize,
                severity: Severity::Medium,
                message: format!(
                    "quantity {} below minimum {}",
                    order.quantity, self.config.min_order_size
                ),
            });
        }
        if order.quantity > self.config.max_order_size {
            violations.push(RiskViolation {
                kind: ViolationKind::MaxOrderSize,
                severity: Severity::Medium,
                message: format!(
                    "quantity {} above maximum {}",
                    order.quantity, self.config.max_order_size
                ),
            });
        }

        if order.side == Side::Buy
            && state.open_positions.len() as u32 >= self.config.max_open_positions
        {
            violations.push(RiskViolation {
                kind: ViolationKind::MaxPositions,
                severity: Severity::High,
                message: format!(
                    "{} open positions at cap {}",
                    state.open_positions.len(),
                    self.config.max_open_positions
                ),
            });
        }

        if state.daily_pnl <= -self.config.max_daily_loss {
            violations.push(RiskViolation {
                kind: ViolationKind::DailyLossLimit,
                severity: Severity::Critical,
                message: format!(
                    "daily P&L {:.2} breached loss limit {:.2}",
                    state.daily_pnl, self.config.max_daily_loss
                ),
            });
        }
        if state.daily_pnl >= self.config.max_daily_profit {
            violations.push(RiskViolation {
                kind: ViolationKind::DailyProfitLimit,
                severity: Severity::Medium,
                message: format!(
                    "daily P&L {:.2} reached profit target {:.2}",
                    state.daily_pnl, self.config.max_daily_profit
                ),
            });
        }

        if self.config.trading_hours.enabled && !self.within_trading_hours() {
            violations.push(RiskViolation {
                kind: ViolationKind::OutsideTradingHours,
                severity: Severity::Low,
                message: "submitted outside configured trading-hours window".into(),
            });
        }

        if let Some(spec) = order.stop_loss_spec {
            let balance = self.account_balance(state);
            if let Some(entry) = order.limit_price.or(order.stop_price) {
                if balance > 0.0 {
                    let distance_points = self.stop_distance_points(&spec, entry);
                    let risk_pct = distance_points * order.quantity as f64 / balance * 100.0;
                    if risk_pct > self.config.max_risk_pct_per_trade {
                        violations.push(RiskViolation {
                            kind: ViolationKind::ExcessiveRisk,
                            severity: Severity::High,
                            message: format!(
                                "risk {risk_pct:.2}% exceeds max {:.2}%",
                                self.config.max_risk_pct_per_trade
                            ),
                        });
                    }
                }
            }
        }

        for violation in &violations {
            state.record_violation(order.id.clone(), violation.clone());
        }

        RiskCheckResult {
            valid: violations.is_empty(),
            violations,
        }
    }

    /// Distance from `entry` to the stop, in price points, for any
    /// `stopLossSpec` kind — mirrors `sltp::resolve_stop`'s offset
    /// computation rather than assuming `Price` (§4.3).
    fn stop_distance_points(&self, spec: &crate::models::PriceSpec, entry: f64) -> f64 {
        use crate::models::StopSpecKind;
        match spec.kind {
            StopSpecKind::Points | StopSpecKind::Atr => spec.value,
            StopSpecKind::Dollars => spec.value / self.config.default_dollar_per_point.max(f64::MIN_POSITIVE),
            StopSpecKind::Percent => entry * (spec.value / 100.0),
            StopSpecKind::Price => (entry - spec.value).abs(),
        }
    }

    fn within_trading_hours(&self) -> bool {
        let now = Utc::now();
        let minute_of_day = now.hour() * 60 + now.minute();
        let hours = &self.config.trading_hours;
        minute_of_day >= hours.start_minute && minute_of_day < hours.end_minute
    }

    /// Uses the cached balance if fresh (TTL §4.3), else the configured
    /// fallback. A live gateway fetch is performed by the caller and fed
    /// back into `RiskState.cached_balance` (§4.3: "on failure the last
    /// cached value is used").
    fn account_balance(&self, state: &RiskState) -> f64 {
        match state.cached_balance {
            Some(cached) if cached.fetched_at.elapsed() < self.config.balance_cache_ttl => {
                cached.balance
            }
            Some(cached) => cached.balance,
            None => self.config.fallback_balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_order() -> Order {
        Order {
            id: "O1".into(),
            source: "B1".into(),
            source_kind: crate::models::SourceKind::Bot,
            instrument: "MES".into(),
            side: Side::Buy,
            order_type: crate::models::OrderType::Market,
            quantity: 1,
            limit_price: None,
            stop_price: None,
            stop_loss_spec: None,
            take_profit_spec: None,
            account_id: "ACC1".into(),
            urgency: false,
            metadata: HashMap::new(),
            submitted_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn daily_loss_limit_is_inclusive_at_exact_threshold() {
        let cfg = Config {
            max_daily_loss: 800.0,
            ..Config::default()
        };
        let manager = RiskManager::new(cfg);
        let mut state = RiskState::new();
        state.daily_pnl = -800.0;
        let result = manager.validate(&sample_order(), &mut state);
        assert!(!result.valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::DailyLossLimit));
    }

    #[test]
    fn collects_all_violations_without_short_circuiting() {
        let cfg = Config {
            max_order_size: 0,
            max_daily_loss: 1.0,
            ..Config::default()
        };
        let manager = RiskManager::new(cfg);
        let mut state = RiskState::new();
        state.daily_pnl = -5.0;
        let result = manager.validate(&sample_order(), &mut state);
        assert!(result.violations.len() >= 2);
    }

    #[test]
    fn within_normal_bounds_passes() {
        let manager = RiskManager::new(Config::default());
        let mut state = RiskState::new();
        let result = manager.validate(&sample_order(), &mut state);
        assert!(result.valid);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn excessive_risk_fires_for_points_kind_not_just_price() {
        let cfg = Config {
            max_risk_pct_per_trade: 1.0,
            fallback_balance: 10_000.0,
            ..Config::default()
        };
        let manager = RiskManager::new(cfg);
        let mut state = RiskState::new();
        let mut order = sample_order();
        order.limit_price = Some(4500.0);
        order.quantity = 50;
        order.stop_loss_spec = Some(crate::models::PriceSpec {
            kind: crate::models::StopSpecKind::Points,
            value: 4.0,
        });
        let result = manager.validate(&order, &mut state);
        assert!(!result.valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ExcessiveRisk));
    }

    #[test]
    fn excessive_risk_converts_dollars_kind_via_dollar_per_point() {
        let cfg = Config {
            max_risk_pct_per_trade: 1.0,
            fallback_balance: 10_000.0,
            default_dollar_per_point: 5.0,
            ..Config::default()
        };
        let manager = RiskManager::new(cfg);
        let mut state = RiskState::new();
        let mut order = sample_order();
        order.limit_price = Some(4500.0);
        order.quantity = 50;
        order.stop_loss_spec = Some(crate::models::PriceSpec {
            kind: crate::models::StopSpecKind::Dollars,
            value: 20.0,
        });
        let result = manager.validate(&order, &mut state);
        assert!(!result.valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ExcessiveRisk));
    }

    #[test]
    fn max_positions_only_blocks_buys() {
        let cfg = Config {
            max_open_positions: 0,
            ..Config::default()
        };
        let manager = RiskManager::new(cfg);
        let mut state = RiskState::new();
        let mut sell_order = sample_order();
        sell_order.side = Side::Sell;
        let result = manager.validate(&sell_order, &mut state);
        assert!(!result
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::MaxPositions));
    }
}
