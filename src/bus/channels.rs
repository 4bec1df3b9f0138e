//! Wire channel names (§6). Per-account/per-bot channels are built with the
//! `*_for` helpers.

pub const ORDERS_IN: &str = "aggregator:orders";
pub const REQUESTS_IN: &str = "aggregator:requests";
pub const MARKET_DATA_IN: &str = "market:data";
pub const CONTROL_IN: &str = "aggregator:control";

pub const POSITION_UPDATES_OUT: &str = "aggregator:position-updates";
pub const MARKET_DATA_OUT: &str = "aggregator:market-data";
pub const METRICS_OUT: &str = "aggregator:metrics";
pub const HEALTH_OUT: &str = "aggregator:health";
pub const ALERTS_OUT: &str = "aggregator:alerts";
pub const FILL_ENHANCED_OUT: &str = "fill:enhanced";

pub fn fills_in_for(account_id: &str) -> String {
    format!("fills:{account_id}")
}

/// The core dispatch loop subscribes here for every account at once;
/// `fills_in_for` remains for producers that publish (or mirror) fills on a
/// single account's own channel.
pub const FILLS_IN: &str = "aggregator:fills";

pub fn bot_responses_for(bot_id: &str) -> String {
    format!("bot:{bot_id}:responses")
}

pub fn positions_out_for(account_id: &str) -> String {
    format!("positions:{account_id}")
}

pub fn bot_close_response_for(request_id: &str) -> String {
    format!("bot-close-response:{request_id}")
}
