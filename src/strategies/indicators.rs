// src/strategies/indicators.rs
//! Thin helpers over the `ta` crate. Indicators run on `f64`; money stays in
//! `Decimal` everywhere else.

use crate::types::Candle;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use ta::indicators::{AverageTrueRange, BollingerBands, MovingAverageConvergenceDivergence};
use ta::{Close, High, Low, Next};

/// Window used for volume averaging, Bollinger Bands and support/resistance.
pub const BAND_WINDOW: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl PriceSeries {
    pub fn from_candles(bars: &[Candle]) -> Self {
        let mut series = PriceSeries {
            high: Vec::with_capacity(bars.len()),
            low: Vec::with_capacity(bars.len()),
            close: Vec::with_capacity(bars.len()),
            volume: Vec::with_capacity(bars.len()),
        };
        for bar in bars {
            series.high.push(bar.high.to_f64().unwrap_or(0.0));
            series.low.push(bar.low.to_f64().unwrap_or(0.0));
            series.close.push(bar.close.to_f64().unwrap_or(0.0));
            series.volume.push(bar.volume.to_f64().unwrap_or(0.0));
        }
        series
    }

    pub fn last_close(&self) -> f64 {
        self.close.last().copied().unwrap_or(0.0)
    }
}

struct Hlc {
    high: f64,
    low: f64,
    close: f64,
}

impl High for Hlc {
    fn high(&self) -> f64 {
        self.high
    }
}

impl Low for Hlc {
    fn low(&self) -> f64 {
        self.low
    }
}

impl Close for Hlc {
    fn close(&self) -> f64 {
        self.close
    }
}

/// Feeds every value through `indicator` and keeps each output.
pub fn series<I>(mut indicator: I, values: &[f64]) -> Vec<f64>
where
    I: Next<f64, Output = f64>,
{
    values.iter().map(|v| indicator.next(*v)).collect()
}

/// Last output of `indicator` over `values`, or `fallback` when there is none.
pub fn last_value<I>(mut indicator: I, values: &[f64], fallback: f64) -> f64
where
    I: Next<f64, Output = f64>,
{
    let mut out = fallback;
    for v in values {
        out = indicator.next(*v);
    }
    finite_or(out, fallback)
}

pub fn last_atr(mut atr: AverageTrueRange, series: &PriceSeries) -> f64 {
    let mut out = 0.0;
    for i in 0..series.close.len() {
        let bar = Hlc {
            high: series.high[i],
            low: series.low[i],
            close: series.close[i],
        };
        out = atr.next(&bar);
    }
    finite_or(out, 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdSnapshot {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

pub fn last_macd(mut macd: MovingAverageConvergenceDivergence, values: &[f64]) -> MacdSnapshot {
    let mut snapshot = MacdSnapshot {
        macd: 0.0,
        signal: 0.0,
        histogram: 0.0,
    };
    for v in values {
        let out = macd.next(*v);
        snapshot = MacdSnapshot {
            macd: finite_or(out.macd, 0.0),
            signal: finite_or(out.signal, 0.0),
            histogram: finite_or(out.histogram, 0.0),
        };
    }
    snapshot
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandsSnapshot {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BandsSnapshot {
    /// Band width relative to the middle band; zero when the middle is zero.
    pub fn relative_width(&self) -> f64 {
        if self.middle == 0.0 {
            return 0.0;
        }
        (self.upper - self.lower) / self.middle
    }
}

pub fn last_bands(mut bands: BollingerBands, values: &[f64]) -> BandsSnapshot {
    let mut snapshot = BandsSnapshot {
        upper: 0.0,
        middle: 0.0,
        lower: 0.0,
    };
    for v in values {
        let out = bands.next(*v);
        snapshot = BandsSnapshot {
            upper: out.upper,
            middle: out.average,
            lower: out.lower,
        };
    }
    snapshot
}

/// Current volume over its trailing average (current bar included).
/// A zero average reads as neutral (1.0).
pub fn volume_ratio(volumes: &[f64], window: usize) -> f64 {
    let Some(current) = volumes.last() else {
        return 1.0;
    };
    let start = volumes.len().saturating_sub(window.max(1));
    let recent = &volumes[start..];
    let average = recent.iter().sum::<f64>() / recent.len() as f64;
    if average <= 0.0 || !average.is_finite() {
        return 1.0;
    }
    current / average
}

/// Rolling (min low, max high) of the last `window` bars.
pub fn support_resistance(series: &PriceSeries, window: usize) -> (f64, f64) {
    let start = series.close.len().saturating_sub(window.max(1));
    let support = series.low[start..]
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let resistance = series.high[start..]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    (finite_or(support, 0.0), finite_or(resistance, 0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extremum {
    Low,
    High,
}

/// Points strictly below (or above) both neighbours on each side.
pub fn local_extrema(values: &[f64], kind: Extremum) -> Vec<(usize, f64)> {
    if values.len() < 5 {
        return Vec::new();
    }
    let beats = |a: f64, b: f64| match kind {
        Extremum::Low => a < b,
        Extremum::High => a > b,
    };
    (2..values.len() - 2)
        .filter(|&i| {
            let v = values[i];
            beats(v, values[i - 1])
                && beats(v, values[i - 2])
                && beats(v, values[i + 1])
                && beats(v, values[i + 2])
        })
        .map(|i| (i, values[i]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Price lower low, oscillator higher low.
    Bullish,
    /// Price higher high, oscillator lower high.
    Bearish,
}

/// Compares the two most recent extrema of price and oscillator inside the
/// trailing `lookback` window.
pub fn detect_divergence(
    prices: &[f64],
    oscillator: &[f64],
    lookback: usize,
    kind: Divergence,
) -> bool {
    let len = prices.len().min(oscillator.len()).min(lookback);
    if len < 5 {
        return false;
    }
    let prices = &prices[prices.len() - len..];
    let oscillator = &oscillator[oscillator.len() - len..];

    let extremum = match kind {
        Divergence::Bullish => Extremum::Low,
        Divergence::Bearish => Extremum::High,
    };
    let price_points = local_extrema(prices, extremum);
    let osc_points = local_extrema(oscillator, extremum);
    if price_points.len() < 2 || osc_points.len() < 2 {
        return false;
    }

    let (_, price_prev) = price_points[price_points.len() - 2];
    let (_, price_last) = price_points[price_points.len() - 1];
    let (_, osc_prev) = osc_points[osc_points.len() - 2];
    let (_, osc_last) = osc_points[osc_points.len() - 1];

    match kind {
        Divergence::Bullish => price_last < price_prev && osc_last > osc_prev,
        Divergence::Bearish => price_last > price_prev && osc_last < osc_prev,
    }
}

pub fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta::indicators::ExponentialMovingAverage;

    #[test]
    fn bullish_divergence_on_lower_low_with_higher_rsi_low() {
        let prices = [10.0, 9.0, 8.0, 9.0, 10.0, 9.0, 7.0, 9.0, 10.0, 11.0];
        let rsi = [50.0, 45.0, 30.0, 45.0, 50.0, 45.0, 35.0, 45.0, 50.0, 55.0];

        assert!(detect_divergence(&prices, &rsi, 10, Divergence::Bullish));
        assert!(!detect_divergence(&prices, &rsi, 10, Divergence::Bearish));
    }

    #[test]
    fn bearish_divergence_on_higher_high_with_lower_rsi_high() {
        let prices = [10.0, 11.0, 12.0, 11.0, 10.0, 11.0, 13.0, 11.0, 10.0, 9.0];
        let rsi = [50.0, 60.0, 75.0, 60.0, 50.0, 60.0, 70.0, 60.0, 50.0, 45.0];

        assert!(detect_divergence(&prices, &rsi, 10, Divergence::Bearish));
        assert!(!detect_divergence(&prices, &rsi, 10, Divergence::Bullish));
    }

    #[test]
    fn no_divergence_with_fewer_than_two_extrema() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let rsi: Vec<f64> = (0..20).map(|i| 40.0 + i as f64).collect();
        assert!(!detect_divergence(&rising, &rsi, 10, Divergence::Bullish));
        assert!(!detect_divergence(&rising, &rsi, 10, Divergence::Bearish));

        // One price low only.
        let prices = [10.0, 9.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0];
        let osc = [50.0, 45.0, 30.0, 45.0, 50.0, 45.0, 35.0, 45.0];
        assert!(!detect_divergence(&prices, &osc, 8, Divergence::Bullish));
    }

    #[test]
    fn short_windows_never_diverge() {
        let prices = [10.0, 8.0, 10.0, 7.0];
        let rsi = [50.0, 30.0, 50.0, 35.0];
        assert!(!detect_divergence(&prices, &rsi, 10, Divergence::Bullish));
        assert!(local_extrema(&prices, Extremum::Low).is_empty());
    }

    #[test]
    fn extrema_must_be_strict() {
        let flat_bottom = [5.0, 4.0, 3.0, 3.0, 4.0, 5.0];
        assert!(local_extrema(&flat_bottom, Extremum::Low).is_empty());
        let peak = [1.0, 2.0, 3.0, 2.0, 1.0];
        assert_eq!(local_extrema(&peak, Extremum::High), vec![(2, 3.0)]);
    }

    #[test]
    fn zero_volume_average_is_neutral() {
        assert_eq!(volume_ratio(&[0.0; 30], BAND_WINDOW), 1.0);
        assert_eq!(volume_ratio(&[], BAND_WINDOW), 1.0);
        let mut volumes = vec![100.0; 19];
        volumes.push(300.0);
        let ratio = volume_ratio(&volumes, BAND_WINDOW);
        assert!((ratio - 300.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn support_and_resistance_use_trailing_window() {
        let mut series = PriceSeries::default();
        for i in 0..30 {
            let base = 100.0 + i as f64;
            series.high.push(base + 1.0);
            series.low.push(base - 1.0);
            series.close.push(base);
            series.volume.push(10.0);
        }
        let (support, resistance) = support_resistance(&series, 20);
        assert_eq!(support, 109.0);
        assert_eq!(resistance, 130.0);
    }

    #[test]
    fn series_tracks_every_input() {
        let ema = ExponentialMovingAverage::new(3).unwrap();
        let out = series(ema, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 1.0);
        assert!(out[3] > out[2]);
    }
}
