// src/core/risk.rs
//! Stop, target and sizing arithmetic. Pure functions over `Decimal`; every
//! division is guarded so a zero price or balance yields zero instead of a panic.

use crate::types::Side;
use rust_decimal::Decimal;

/// Quote-currency budget turned into base units:
/// `free × risk_percentage × strength / price`.
pub fn position_size(
    free_quote: Decimal,
    risk_percentage: Decimal,
    strength: Decimal,
    price: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO || free_quote <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let budget = free_quote * risk_percentage * strength;
    if budget <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    budget / price
}

/// Without an ATR the stop sits `default_pct` away from entry. With one, the
/// distance is `atr × multiplier`, applied as a fraction of entry.
pub fn stop_loss(
    entry_price: Decimal,
    side: Side,
    atr: Option<Decimal>,
    multiplier: Decimal,
    default_pct: Decimal,
) -> Decimal {
    let fraction = match atr {
        Some(atr) if atr > Decimal::ZERO && entry_price > Decimal::ZERO => {
            atr * multiplier / entry_price
        }
        _ => default_pct,
    };
    match side {
        Side::Buy => entry_price * (Decimal::ONE - fraction),
        Side::Sell => entry_price * (Decimal::ONE + fraction),
    }
}

/// Target placed `risk_reward_ratio` stop-distances away, on the profit side.
pub fn take_profit(
    entry_price: Decimal,
    side: Side,
    risk_reward_ratio: Decimal,
    default_stop_pct: Decimal,
) -> Decimal {
    let distance = entry_price * default_stop_pct * risk_reward_ratio;
    match side {
        Side::Buy => entry_price + distance,
        Side::Sell => entry_price - distance,
    }
}
