//! Stop-loss/take-profit calculator (§4.6): resolves a `PriceSpec` against a
//! fill price onto the instrument's tick grid using fixed-point arithmetic,
//! so repeated rounding never drifts a stop off-grid the way naive `f64`
//! rounding would.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::error::{AggregatorError, Result};
use crate::models::{PriceSpec, Side, StopSpecKind};

/// Rounds `price` to the nearest `tick_size`, banker's-rounding-free (half
/// away from zero), per §4.6's "never produce a price off the tick grid".
pub fn round_to_tick(price: f64, tick_size: f64) -> Result<f64> {
    if tick_size <= 0.0 || !price.is_finite() {
        return Err(AggregatorError::InvalidTick { tick_size, price });
    }
    let price_dec = Decimal::from_f64_retain(price).ok_or(AggregatorError::InvalidTick {
        tick_size,
        price,
    })?;
    let tick_dec = Decimal::from_f64_retain(tick_size).ok_or(AggregatorError::InvalidTick {
        tick_size,
        price,
    })?;
    let ticks = (price_dec / tick_dec).round();
    let rounded = ticks * tick_dec;
    rounded.to_f64().ok_or(AggregatorError::InvalidTick { tick_size, price })
}

#[derive(Debug, Clone, Copy)]
pub struct Levels {
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

/// Resolves a stop-loss spec against the fill price and side (§4.6). BUY
/// stops sit below the fill, SELL stops above; mirrored for take-profit.
pub fn resolve_stop(
    spec: &PriceSpec,
    side: Side,
    fill_price: f64,
    tick_size: f64,
    dollar_per_point: f64,
) -> Result<f64> {
    let offset_points = match spec.kind {
        StopSpecKind::Points => spec.value,
        StopSpecKind::Dollars => spec.value / dollar_per_point.max(f64::MIN_POSITIVE),
        StopSpecKind::Percent => fill_price * (spec.value / 100.0),
        StopSpecKind::Atr => spec.value,
        StopSpecKind::Price => return round_to_tick(spec.value, tick_size),
    };
    let raw = match side {
        Side::Buy => fill_price - offset_points,
        Side::Sell => fill_price + offset_points,
    };
    round_to_tick(raw, tick_size)
}

/// Resolves a take-profit spec; offsets run in the opposite direction of the
/// stop for the same side (§4.6).
pub fn resolve_take_profit(
    spec: &PriceSpec,
    side: Side,
    fill_price: f64,
    tick_size: f64,
    dollar_per_point: f64,
) -> Result<f64> {
    let offset_points = match spec.kind {
        StopSpecKind::Points => spec.value,
        StopSpecKind::Dollars => spec.value / dollar_per_point.max(f64::MIN_POSITIVE),
        StopSpecKind::Percent => fill_price * (spec.value / 100.0),
        StopSpecKind::Atr => spec.value,
        StopSpecKind::Price => return round_to_tick(spec.value, tick_size),
    };
    let raw = match side {
        Side::Buy => fill_price + offset_points,
        Side::Sell => fill_price - offset_points,
    };
    round_to_tick(raw, tick_size)
}

/// Computes both levels and, when a minimum risk:reward is configured,
/// extends the take-profit (never shrinks the stop) so the ratio clears the
/// floor (§4.6: "extend TP to meet minRR, never shrink SL").
pub fn compute_levels(
    stop_spec: Option<PriceSpec>,
    take_profit_spec: Option<PriceSpec>,
    side: Side,
    fill_price: f64,
    tick_size: f64,
    dollar_per_point: f64,
    min_risk_reward: f64,
) -> Result<Levels> {
    let stop_price = stop_spec
        .map(|spec| resolve_stop(&spec, side, fill_price, tick_size, dollar_per_point))
        .transpose()?;

    let mut take_profit_price = take_profit_spec
        .map(|spec| resolve_take_profit(&spec, side, fill_price, tick_size, dollar_per_point))
        .transpose()?;

    if let (Some(stop), Some(tp)) = (stop_price, take_profit_price) {
        let risk = (fill_price - stop).abs();
        let reward = (tp - fill_price).abs();
        if risk > 0.0 && reward / risk < min_risk_reward {
            let required_reward = risk * min_risk_reward;
            let extended = match side {
                Side::Buy => fill_price + required_reward,
                Side::Sell => fill_price - required_reward,
            };
            take_profit_price = Some(round_to_tick(extended, tick_size)?);
        }
    }

    Ok(Levels {
        stop_price,
        take_profit_price,
    })
}

/// Validates that a stop sits on the loss side of the fill and a take
/// profit on the gain side, per the order's direction (§4.6).
pub fn validate_levels(side: Side, fill_price: f64, levels: &Levels) -> std::result::Result<(), String> {
    if let Some(stop) = levels.stop_price {
        let valid = match side {
            Side::Buy => stop < fill_price,
            Side::Sell => stop > fill_price,
        };
        if !valid {
            return Err(format!(
                "stop {stop} is not on the loss side of fill {fill_price} for {side:?}"
            ));
        }
    }
    if let Some(tp) = levels.take_profit_price {
        let valid = match side {
            Side::Buy => tp > fill_price,
            Side::Sell => tp < fill_price,
        };
        if !valid {
            return Err(format!(
                "take-profit {tp} is not on the gain side of fill {fill_price} for {side:?}"
            ));
        }
    }
    Ok(())
}

/// Optional trailing-stop mode (§4.6): the stop only ever moves in the
/// favorable direction, activating once price has moved `activation_points`
/// in profit, then trailing by `trail_points` behind the high/low watermark.
#[derive(Debug, Clone, Copy)]
pub struct TrailingStop {
    pub side: Side,
    pub activation_points: f64,
    pub trail_points: f64,
    pub high_water_mark: f64,
    pub low_water_mark: f64,
    pub trailing_activated: bool,
    pub current_stop: f64,
}

impl TrailingStop {
    pub fn new(side: Side, entry_price: f64, activation_points: f64, trail_points: f64, initial_stop: f64) -> Self {
        Self {
            side,
            activation_points,
            trail_points,
            high_water_mark: entry_price,
            low_water_mark: entry_price,
            trailing_activated: false,
            current_stop: initial_stop,
        }
    }

    /// Feeds a new market price; returns `true` if the stop moved.
    pub fn on_price(&mut self, price: f64, tick_size: f64) -> Result<bool> {
        let mut moved = false;
        match self.side {
            Side::Buy => {
                if price > self.high_water_mark {
                    self.high_water_mark = price;
                }
                if !self.trailing_activated
                    && self.high_water_mark - self.low_water_mark >= self.activation_points
                {
                    self.trailing_activated = true;
                }
                if self.trailing_activated {
                    let candidate = round_to_tick(self.high_water_mark - self.trail_points, tick_size)?;
                    if candidate > self.current_stop {
                        self.current_stop = candidate;
                        moved = true;
                    }
                }
            }
            Side::Sell => {
                if price < self.low_water_mark {
                    self.low_water_mark = price;
                }
                if !self.trailing_activated
                    && self.high_water_mark - self.low_water_mark >= self.activation_points
                {
                    self.trailing_activated = true;
                }
                if self.trailing_activated {
                    let candidate = round_to_tick(self.low_water_mark + self.trail_points, tick_size)?;
                    if candidate < self.current_stop {
                        self.current_stop = candidate;
                        moved = true;
                    }
                }
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_nearest_tick() {
        assert_eq!(round_to_tick(4500.13, 0.25).unwrap(), 4500.25);
    }

    #[test]
    fn zero_tick_size_is_invalid() {
        assert!(round_to_tick(100.0, 0.0).is_err());
    }

    #[test]
    fn nan_price_is_invalid() {
        assert!(round_to_tick(f64::NAN, 0.25).is_err());
    }

    #[test]
    fn buy_stop_sits_below_fill() {
        let spec = PriceSpec {
            kind: StopSpecKind::Points,
            value: 4.0,
        };
        let stop = resolve_stop(&spec, Side::Buy, 4500.0, 0.25, 5.0).unwrap();
        assert_eq!(stop, 4496.0);
    }

    #[test]
    fn sell_take_profit_sits_below_fill() {
        let spec = PriceSpec {
            kind: StopSpecKind::Points,
            value: 8.0,
        };
        let tp = resolve_take_profit(&spec, Side::Sell, 4500.0, 0.25, 5.0).unwrap();
        assert_eq!(tp, 4492.0);
    }

    #[test]
    fn take_profit_extends_to_meet_min_risk_reward_without_shrinking_stop() {
        let stop_spec = PriceSpec {
            kind: StopSpecKind::Points,
            value: 4.0,
        };
        let tp_spec = PriceSpec {
            kind: StopSpecKind::Points,
            value: 4.0,
        };
        let levels = compute_levels(
            Some(stop_spec),
            Some(tp_spec),
            Side::Buy,
            4500.0,
            0.25,
            5.0,
            2.0,
        )
        .unwrap();
        assert_eq!(levels.stop_price, Some(4496.0));
        assert_eq!(levels.take_profit_price, Some(4508.0));
    }

    #[test]
    fn validate_levels_rejects_stop_on_wrong_side() {
        let levels = Levels {
            stop_price: Some(4510.0),
            take_profit_price: None,
        };
        assert!(validate_levels(Side::Buy, 4500.0, &levels).is_err());
    }

    #[test]
    fn trailing_stop_only_moves_favorably() {
        let mut trailing = TrailingStop::new(Side::Buy, 4500.0, 4.0, 2.0, 4496.0);
        assert!(!trailing.on_price(4501.0, 0.25).unwrap());
        assert!(trailing.on_price(4506.0, 0.25).unwrap());
        assert_eq!(trailing.current_stop, 4504.0);
        assert!(!trailing.on_price(4503.0, 0.25).unwrap());
        assert_eq!(trailing.current_stop, 4504.0);
    }
}
