// src/strategies/test_support.rs
use crate::types::Candle;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Hourly bars with a 1% high/low envelope around each close.
pub fn bars_from_closes(closes: &[f64], volume: f64) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let close = Decimal::from_f64(*close).unwrap();
            Candle {
                timestamp: start + Duration::hours(i as i64),
                open: close,
                high: close * Decimal::new(101, 2),
                low: close * Decimal::new(99, 2),
                close,
                volume: Decimal::from_f64(volume).unwrap(),
            }
        })
        .collect()
}

pub fn flat_bars(count: usize, price: f64) -> Vec<Candle> {
    bars_from_closes(&vec![price; count], 1_000.0)
}
