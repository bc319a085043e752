// src/strategies/rsi_reversion.rs
use crate::errors::StrategyError;
use crate::strategies::indicators::{
    detect_divergence, last_atr, series, volume_ratio, Divergence, PriceSeries, BAND_WINDOW,
};
use crate::strategies::traits::{check_window, Analysis, Strategy};
use crate::types::{Candle, Side, TradingSignal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ta::indicators::{AverageTrueRange, ExponentialMovingAverage, RelativeStrengthIndex};

const EXTREME_WEIGHT: f64 = 0.3;
const DIVERGENCE_WEIGHT: f64 = 0.4;
const ALIGNMENT_WEIGHT: f64 = 0.2;
const VOLUME_WEIGHT: f64 = 0.1;
const VOLUME_SPIKE: f64 = 1.5;
const ATR_PERIOD: usize = 14;
const SAFETY_MARGIN: usize = 10;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReversionParams {
    pub rsi_period: usize,
    pub oversold: f64,
    pub overbought: f64,
    pub trend_ema_period: usize,
    pub divergence_lookback: usize,
    pub min_divergence_bars: usize,
    pub volume_confirmation: bool,
}

impl Default for ReversionParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            oversold: 30.0,
            overbought: 70.0,
            trend_ema_period: 50,
            divergence_lookback: 10,
            min_divergence_bars: 5,
            volume_confirmation: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReversionReport {
    pub rsi: f64,
    pub trend_ema: f64,
    pub trend: Trend,
    pub close: f64,
    pub atr: f64,
    pub oversold: bool,
    pub overbought: bool,
    pub bullish_divergence: bool,
    pub bearish_divergence: bool,
    pub volume_ratio: f64,
    pub volume_spike: bool,
    pub signal_strength: f64,
    pub buy_signal: bool,
    pub sell_signal: bool,
}

/// RSI mean reversion, confirmed by divergence or the trend EMA.
#[derive(Debug, Clone)]
pub struct RsiReversion {
    name: String,
    params: ReversionParams,
    rsi: RelativeStrengthIndex,
    trend: ExponentialMovingAverage,
    atr: AverageTrueRange,
}

impl RsiReversion {
    pub const KIND: &'static str = "rsi_reversion";

    pub fn new(params: ReversionParams) -> Result<Self, StrategyError> {
        Self::named("RsiReversion", params)
    }

    pub fn named(name: impl Into<String>, params: ReversionParams) -> Result<Self, StrategyError> {
        let name = name.into();
        let invalid = |message: String| StrategyError::InvalidParameter {
            strategy: name.clone(),
            message,
        };
        if params.oversold >= params.overbought {
            return Err(invalid(format!(
                "oversold ({}) must be below overbought ({})",
                params.oversold, params.overbought
            )));
        }
        let rsi = RelativeStrengthIndex::new(params.rsi_period)
            .map_err(|e| invalid(format!("rsi_period: {e:?}")))?;
        let trend = ExponentialMovingAverage::new(params.trend_ema_period)
            .map_err(|e| invalid(format!("trend_ema_period: {e:?}")))?;
        let atr = AverageTrueRange::new(ATR_PERIOD)
            .map_err(|e| invalid(format!("atr: {e:?}")))?;

        Ok(Self {
            name,
            params,
            rsi,
            trend,
            atr,
        })
    }

    pub fn params(&self) -> &ReversionParams {
        &self.params
    }

    fn divergence(&self, closes: &[f64], rsi: &[f64], kind: Divergence) -> bool {
        let p = &self.params;
        if closes.len() < p.divergence_lookback + p.min_divergence_bars {
            return false;
        }
        detect_divergence(closes, rsi, p.divergence_lookback, kind)
    }

    fn evaluate(&self, prices: &PriceSeries) -> ReversionReport {
        let p = &self.params;
        let rsi_series = series(self.rsi.clone(), &prices.close);
        let trend_series = series(self.trend.clone(), &prices.close);

        let rsi = rsi_series.last().copied().unwrap_or(50.0);
        let trend_ema = trend_series.last().copied().unwrap_or(0.0);
        let close = prices.last_close();
        let trend = if close > trend_ema {
            Trend::Bullish
        } else {
            Trend::Bearish
        };

        let oversold = rsi < p.oversold;
        let overbought = rsi > p.overbought;
        let bullish_divergence = self.divergence(&prices.close, &rsi_series, Divergence::Bullish);
        let bearish_divergence = self.divergence(&prices.close, &rsi_series, Divergence::Bearish);
        let ratio = volume_ratio(&prices.volume, BAND_WINDOW);
        let volume_spike = ratio > VOLUME_SPIKE;
        let volume_ok = !p.volume_confirmation || volume_spike;

        let buy_signal = oversold && (bullish_divergence || trend == Trend::Bullish) && volume_ok;
        let sell_signal =
            overbought && (bearish_divergence || trend == Trend::Bearish) && volume_ok;

        let mut strength = 0.0;
        if oversold || overbought {
            strength += EXTREME_WEIGHT;
        }
        if bullish_divergence || bearish_divergence {
            strength += DIVERGENCE_WEIGHT;
        }
        if (oversold && trend == Trend::Bullish) || (overbought && trend == Trend::Bearish) {
            strength += ALIGNMENT_WEIGHT;
        }
        if p.volume_confirmation && volume_spike {
            strength += VOLUME_WEIGHT;
        }

        ReversionReport {
            rsi,
            trend_ema,
            trend,
            close,
            atr: last_atr(self.atr.clone(), prices),
            oversold,
            overbought,
            bullish_divergence,
            bearish_divergence,
            volume_ratio: ratio,
            volume_spike,
            signal_strength: f64::min(strength, 1.0),
            buy_signal,
            sell_signal,
        }
    }
}

impl Strategy for RsiReversion {
    type Report = ReversionReport;

    fn name(&self) -> &str {
        &self.name
    }

    fn required_periods(&self) -> usize {
        self.params
            .rsi_period
            .max(self.params.trend_ema_period)
            .max(self.params.divergence_lookback)
            .max(BAND_WINDOW)
            + SAFETY_MARGIN
    }

    fn analyze(&self, bars: &[Candle]) -> Analysis<ReversionReport> {
        if let Some(rejected) = check_window(bars, self.required_periods()) {
            return rejected;
        }
        Analysis::Ready(self.evaluate(&PriceSeries::from_candles(bars)))
    }

    fn should_buy(&self, bars: &[Candle]) -> bool {
        self.analyze(bars).ready().is_some_and(|r| r.buy_signal)
    }

    fn should_sell(&self, bars: &[Candle]) -> bool {
        self.analyze(bars).ready().is_some_and(|r| r.sell_signal)
    }

    fn generate_signal(&self, symbol: &str, bars: &[Candle]) -> Option<TradingSignal> {
        let report = self.analyze(bars).ready()?;
        let (side, divergence, extreme) = if report.buy_signal {
            (Side::Buy, report.bullish_divergence, report.oversold)
        } else if report.sell_signal {
            (Side::Sell, report.bearish_divergence, report.overbought)
        } else {
            return None;
        };

        let metadata = json!({
            "atr": report.atr,
            "rsi": report.rsi,
            "trend": report.trend,
            "trend_ema": report.trend_ema,
            "divergence": divergence,
            "extreme": extreme,
            "volume_ratio": report.volume_ratio,
        });

        Some(TradingSignal::new(
            symbol,
            side,
            report.signal_strength,
            f64::min(report.signal_strength + 0.1, 1.0),
            self.name.clone(),
            metadata,
        ))
    }
}
