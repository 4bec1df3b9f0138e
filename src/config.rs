//! Service configuration: environment-sourced defaults overridable by CLI
//! flags, matching the existing `Config::from_env` convention.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
pub struct TradingHours {
    pub enabled: bool,
    /// Minutes since UTC midnight.
    pub start_minute: u32,
    pub end_minute: u32,
}

impl Default for TradingHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start_minute: 0,
            end_minute: 24 * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_url: String,
    pub gateway_url: String,
    pub channel_prefix: String,

    // Risk thresholds
    pub min_order_size: u32,
    pub max_order_size: u32,
    pub max_open_positions: u32,
    pub max_daily_loss: f64,
    pub max_daily_profit: f64,
    pub max_risk_pct_per_trade: f64,
    pub trading_hours: TradingHours,
    pub balance_cache_ttl: Duration,
    pub fallback_balance: f64,

    // Queue / throttle
    pub queue_max_size: usize,
    pub max_concurrent_in_flight: usize,
    pub max_orders_per_second: f64,
    pub burst_limit: u32,

    // SL/TP
    pub tick_sizes: HashMap<String, f64>,
    pub default_tick_size: f64,
    pub min_risk_reward: f64,
    pub default_dollar_per_point: f64,

    // P&L (§9 open question resolution)
    pub commission_per_round_trip: Decimal,
    pub contract_multiplier: Decimal,

    // Order mutex / idempotency
    pub lock_ttl: Duration,
    pub lock_cleanup_interval: Duration,
    pub idempotency_cache_size: usize,

    // Source registry
    pub auto_register_unknown_sources: bool,

    // Legacy-compat escape hatch (§9, explicit, defaults off)
    pub allow_dispatch_after_risk_rejection: bool,

    // Gateway RPC timeout
    pub gateway_timeout: Duration,

    // HTTP control surface
    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let mut tick_sizes = HashMap::new();
        tick_sizes.insert("MES".to_string(), 0.25);
        tick_sizes.insert("ES".to_string(), 0.25);
        tick_sizes.insert("NQ".to_string(), 0.25);

        Self {
            bus_url: "ws://127.0.0.1:6379".to_string(),
            gateway_url: "http://127.0.0.1:8088".to_string(),
            channel_prefix: "aggregator".to_string(),

            min_order_size: 1,
            max_order_size: 100,
            max_open_positions: 10,
            max_daily_loss: 800.0,
            max_daily_profit: 2000.0,
            max_risk_pct_per_trade: 2.0,
            trading_hours: TradingHours::default(),
            balance_cache_ttl: Duration::from_secs(5 * 60),
            fallback_balance: 10_000.0,

            queue_max_size: 1000,
            max_concurrent_in_flight: 20,
            max_orders_per_second: 5.0,
            burst_limit: 10,

            tick_sizes,
            default_tick_size: 0.01,
            min_risk_reward: 1.5,
            default_dollar_per_point: 5.0,

            // Matches the historically hard-coded $1.24/round-trip commission
            // and 10x contract multiplier (§9 open question).
            commission_per_round_trip: dec!(1.24),
            contract_multiplier: dec!(10),

            lock_ttl: Duration::from_secs(30),
            lock_cleanup_interval: Duration::from_secs(10),
            idempotency_cache_size: 10_000,

            auto_register_unknown_sources: true,
            allow_dispatch_after_risk_rejection: false,

            gateway_timeout: Duration::from_secs(30),
            http_port: 8090,
        }
    }
}

impl Config {
    /// Loads defaults overlaid with `.env`/environment variables, the way
    /// `models::Config::from_env` does in the source this crate grew out of.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BUS_URL") {
            cfg.bus_url = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_URL") {
            cfg.gateway_url = v;
        }
        if let Ok(v) = std::env::var("CHANNEL_PREFIX") {
            cfg.channel_prefix = v;
        }
        if let Ok(v) = env_parse("MIN_ORDER_SIZE") {
            cfg.min_order_size = v;
        }
        if let Ok(v) = env_parse("MAX_ORDER_SIZE") {
            cfg.max_order_size = v;
        }
        if let Ok(v) = env_parse("MAX_OPEN_POSITIONS") {
            cfg.max_open_positions = v;
        }
        if let Ok(v) = env_parse("MAX_DAILY_LOSS") {
            cfg.max_daily_loss = v;
        }
        if let Ok(v) = env_parse("MAX_DAILY_PROFIT") {
            cfg.max_daily_profit = v;
        }
        if let Ok(v) = env_parse("MAX_RISK_PCT_PER_TRADE") {
            cfg.max_risk_pct_per_trade = v;
        }
        if let Ok(v) = env_parse("MAX_ORDERS_PER_SECOND") {
            cfg.max_orders_per_second = v;
        }
        if let Ok(v) = env_parse("BURST_LIMIT") {
            cfg.burst_limit = v;
        }
        if let Ok(v) = env_parse("QUEUE_MAX_SIZE") {
            cfg.queue_max_size = v;
        }
        if let Ok(v) = env_parse("MAX_CONCURRENT_IN_FLIGHT") {
            cfg.max_concurrent_in_flight = v;
        }
        if let Ok(v) = env_parse("LOCK_TTL_SECS") {
            cfg.lock_ttl = Duration::from_secs(v);
        }
        if let Ok(v) = env_parse("HTTP_PORT") {
            cfg.http_port = v;
        }
        if let Ok(v) = std::env::var("ALLOW_DISPATCH_AFTER_RISK_REJECTION") {
            cfg.allow_dispatch_after_risk_rejection =
                matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }

        Ok(cfg)
    }

    pub fn tick_size(&self, instrument: &str) -> f64 {
        self.tick_sizes
            .get(instrument)
            .copied()
            .unwrap_or(self.default_tick_size)
    }

    /// Merges CLI overrides on top of environment-sourced values, CLI taking
    /// precedence.
    pub fn apply_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(v) = &cli.bus_url {
            self.bus_url = v.clone();
        }
        if let Some(v) = &cli.gateway_url {
            self.gateway_url = v.clone();
        }
        if let Some(v) = cli.max_daily_loss {
            self.max_daily_loss = v;
        }
        if let Some(v) = cli.max_orders_per_second {
            self.max_orders_per_second = v;
        }
        if let Some(v) = cli.http_port {
            self.http_port = v;
        }
        if cli.allow_dispatch_after_risk_rejection {
            self.allow_dispatch_after_risk_rejection = true;
        }
        self
    }

    pub fn load(cli: CliArgs) -> Result<Self> {
        Ok(Self::from_env()?.apply_cli(&cli))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> std::result::Result<T, ()> {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).ok_or(())
}

/// CLI overrides for the order-routing core, layered on top of `Config::from_env`.
#[derive(Debug, Parser)]
#[command(name = "aggregator", about = "Order-routing aggregator core")]
pub struct CliArgs {
    #[arg(long, env = "BUS_URL")]
    pub bus_url: Option<String>,

    #[arg(long, env = "GATEWAY_URL")]
    pub gateway_url: Option<String>,

    #[arg(long, env = "MAX_DAILY_LOSS")]
    pub max_daily_loss: Option<f64>,

    #[arg(long, env = "MAX_ORDERS_PER_SECOND")]
    pub max_orders_per_second: Option<f64>,

    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    #[arg(long, env = "ALLOW_DISPATCH_AFTER_RISK_REJECTION", default_value_t = false)]
    pub allow_dispatch_after_risk_rejection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_commission_matches_legacy_constant() {
        assert_eq!(Config::default().commission_per_round_trip, dec!(1.24));
    }

    #[test]
    fn default_contract_multiplier_matches_legacy_constant() {
        assert_eq!(Config::default().contract_multiplier, dec!(10));
    }

    #[test]
    fn dispatch_after_risk_rejection_defaults_off() {
        assert!(!Config::default().allow_dispatch_after_risk_rejection);
    }

    #[test]
    fn unknown_instrument_falls_back_to_default_tick() {
        let cfg = Config::default();
        assert_eq!(cfg.tick_size("UNKNOWN_XYZ"), cfg.default_tick_size);
    }
}
