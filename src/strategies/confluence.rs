// src/strategies/confluence.rs
use crate::errors::StrategyError;
use crate::strategies::indicators::{
    last_atr, last_bands, last_macd, last_value, support_resistance, volume_ratio, BandsSnapshot,
    MacdSnapshot, PriceSeries, BAND_WINDOW,
};
use crate::strategies::traits::{check_window, Analysis, Strategy};
use crate::types::{Candle, Side, TradingSignal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    RelativeStrengthIndex,
};

const MACD_WEIGHT: f64 = 0.25;
const EMA_WEIGHT: f64 = 0.25;
const RSI_WEIGHT: f64 = 0.20;
const VOLUME_WEIGHT: f64 = 0.15;
const LEVEL_WEIGHT: f64 = 0.15;

/// Share of the entry conditions that must hold for `should_buy`/`should_sell`.
const GATE_QUORUM: f64 = 0.6;
const SAFETY_MARGIN: usize = 10;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfluenceParams {
    pub fast_ema: usize,
    pub slow_ema: usize,
    pub signal_ema: usize,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub volume_threshold: f64,
    pub atr_period: usize,
    pub min_confidence: f64,
}

impl Default for ConfluenceParams {
    fn default() -> Self {
        Self {
            fast_ema: 12,
            slow_ema: 26,
            signal_ema: 9,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            volume_threshold: 1.5,
            atr_period: 14,
            min_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RsiCondition {
    Oversold,
    Overbought,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfluenceIndicators {
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub macd: MacdSnapshot,
    pub rsi: f64,
    pub atr: f64,
    pub volume_ratio: f64,
    pub bands: BandsSnapshot,
    pub support: f64,
    pub resistance: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfluenceReport {
    pub indicators: ConfluenceIndicators,
    pub bullish_score: f64,
    pub bearish_score: f64,
    pub bias: Bias,
    pub signal_strength: f64,
    pub macd_bullish: bool,
    pub macd_bearish: bool,
    pub rsi_condition: RsiCondition,
    pub volume_spike: bool,
    pub bb_squeeze: bool,
    pub bb_expansion: bool,
    pub buy_conditions_met: usize,
    pub sell_conditions_met: usize,
    pub buy_signal: bool,
    pub sell_signal: bool,
}

/// Trend-following confluence of EMA, MACD, RSI, volume and Bollinger Bands.
#[derive(Debug, Clone)]
pub struct TrendConfluence {
    name: String,
    params: ConfluenceParams,
    fast: ExponentialMovingAverage,
    slow: ExponentialMovingAverage,
    macd: MovingAverageConvergenceDivergence,
    rsi: RelativeStrengthIndex,
    atr: AverageTrueRange,
    bands: BollingerBands,
}

impl TrendConfluence {
    pub const KIND: &'static str = "trend_confluence";

    pub fn new(params: ConfluenceParams) -> Result<Self, StrategyError> {
        Self::named("TrendConfluence", params)
    }

    /// Indicator prototypes are validated here once; `analyze` clones them.
    pub fn named(name: impl Into<String>, params: ConfluenceParams) -> Result<Self, StrategyError> {
        let name = name.into();
        let invalid = |message: String| StrategyError::InvalidParameter {
            strategy: name.clone(),
            message,
        };
        if params.fast_ema >= params.slow_ema {
            return Err(invalid(format!(
                "fast_ema ({}) must be shorter than slow_ema ({})",
                params.fast_ema, params.slow_ema
            )));
        }

        let fast = ExponentialMovingAverage::new(params.fast_ema)
            .map_err(|e| invalid(format!("fast_ema: {e:?}")))?;
        let slow = ExponentialMovingAverage::new(params.slow_ema)
            .map_err(|e| invalid(format!("slow_ema: {e:?}")))?;
        let macd = MovingAverageConvergenceDivergence::new(
            params.fast_ema,
            params.slow_ema,
            params.signal_ema,
        )
        .map_err(|e| invalid(format!("macd: {e:?}")))?;
        let rsi = RelativeStrengthIndex::new(params.rsi_period)
            .map_err(|e| invalid(format!("rsi_period: {e:?}")))?;
        let atr = AverageTrueRange::new(params.atr_period)
            .map_err(|e| invalid(format!("atr_period: {e:?}")))?;
        let bands = BollingerBands::new(BAND_WINDOW, 2.0)
            .map_err(|e| invalid(format!("bollinger: {e:?}")))?;

        Ok(Self {
            name,
            params,
            fast,
            slow,
            macd,
            rsi,
            atr,
            bands,
        })
    }

    pub fn params(&self) -> &ConfluenceParams {
        &self.params
    }

    fn indicators(&self, series: &PriceSeries) -> ConfluenceIndicators {
        let (support, resistance) = support_resistance(series, BAND_WINDOW);
        ConfluenceIndicators {
            fast_ema: last_value(self.fast.clone(), &series.close, 0.0),
            slow_ema: last_value(self.slow.clone(), &series.close, 0.0),
            macd: last_macd(self.macd.clone(), &series.close),
            rsi: last_value(self.rsi.clone(), &series.close, 50.0),
            atr: last_atr(self.atr.clone(), series),
            volume_ratio: volume_ratio(&series.volume, BAND_WINDOW),
            bands: last_bands(self.bands.clone(), &series.close),
            support,
            resistance,
            close: series.last_close(),
        }
    }

    fn score(&self, ind: ConfluenceIndicators) -> ConfluenceReport {
        let p = &self.params;

        let macd_bullish = ind.macd.macd > ind.macd.signal && ind.macd.histogram > 0.0;
        let macd_bearish = ind.macd.macd < ind.macd.signal && ind.macd.histogram < 0.0;
        let ema_bullish = ind.fast_ema > ind.slow_ema;
        let ema_bearish = ind.fast_ema < ind.slow_ema;
        let rsi_oversold = ind.rsi < p.rsi_oversold;
        let rsi_overbought = ind.rsi > p.rsi_overbought;
        let rsi_neutral = (40.0..=60.0).contains(&ind.rsi);
        let volume_spike = ind.volume_ratio > p.volume_threshold;
        let width = ind.bands.relative_width();

        let mut bullish = 0.0;
        if macd_bullish {
            bullish += MACD_WEIGHT;
        }
        if ema_bullish {
            bullish += EMA_WEIGHT;
        }
        if rsi_oversold || (rsi_neutral && ema_bullish) {
            bullish += RSI_WEIGHT;
        }
        if volume_spike {
            bullish += VOLUME_WEIGHT;
        }
        if ind.close > ind.support {
            bullish += LEVEL_WEIGHT;
        }

        let mut bearish = 0.0;
        if macd_bearish {
            bearish += MACD_WEIGHT;
        }
        if ema_bearish {
            bearish += EMA_WEIGHT;
        }
        if rsi_overbought || (rsi_neutral && ema_bearish) {
            bearish += RSI_WEIGHT;
        }
        if volume_spike {
            bearish += VOLUME_WEIGHT;
        }
        if ind.close < ind.resistance {
            bearish += LEVEL_WEIGHT;
        }

        let bullish: f64 = f64::min(bullish, 1.0);
        let bearish: f64 = f64::min(bearish, 1.0);

        let (bias, signal_strength) = if bullish > bearish && bullish > p.min_confidence {
            (Bias::Bullish, bullish)
        } else if bearish > bullish && bearish > p.min_confidence {
            (Bias::Bearish, bearish)
        } else {
            (Bias::Neutral, bullish.max(bearish))
        };

        let buy_conditions = [
            ind.macd.macd > ind.macd.signal,
            ind.macd.histogram > 0.0,
            ema_bullish,
            ind.rsi < p.rsi_overbought,
            ind.close > ind.support,
            bias == Bias::Bullish,
            signal_strength > p.min_confidence,
        ];
        let sell_conditions = [
            ind.macd.macd < ind.macd.signal,
            ind.macd.histogram < 0.0,
            ema_bearish,
            ind.rsi > p.rsi_oversold,
            ind.close < ind.resistance,
            bias == Bias::Bearish,
            signal_strength > p.min_confidence,
        ];
        let buy_conditions_met = buy_conditions.iter().filter(|c| **c).count();
        let sell_conditions_met = sell_conditions.iter().filter(|c| **c).count();

        // The score and the condition quorum are separate gates; both must agree.
        let buy_signal = bias == Bias::Bullish && has_quorum(buy_conditions_met, buy_conditions.len());
        let sell_signal =
            bias == Bias::Bearish && has_quorum(sell_conditions_met, sell_conditions.len());

        ConfluenceReport {
            rsi_condition: if rsi_oversold {
                RsiCondition::Oversold
            } else if rsi_overbought {
                RsiCondition::Overbought
            } else {
                RsiCondition::Neutral
            },
            indicators: ind,
            bullish_score: bullish,
            bearish_score: bearish,
            bias,
            signal_strength,
            macd_bullish,
            macd_bearish,
            volume_spike,
            bb_squeeze: width < 0.1,
            bb_expansion: width > 0.2,
            buy_conditions_met,
            sell_conditions_met,
            buy_signal,
            sell_signal,
        }
    }
}

fn has_quorum(met: usize, total: usize) -> bool {
    met as f64 >= total as f64 * GATE_QUORUM
}

impl Strategy for TrendConfluence {
    type Report = ConfluenceReport;

    fn name(&self) -> &str {
        &self.name
    }

    fn required_periods(&self) -> usize {
        self.params
            .slow_ema
            .max(self.params.rsi_period)
            .max(self.params.atr_period)
            .max(BAND_WINDOW)
            + SAFETY_MARGIN
    }

    fn analyze(&self, bars: &[Candle]) -> Analysis<ConfluenceReport> {
        if let Some(rejected) = check_window(bars, self.required_periods()) {
            return rejected;
        }
        let series = PriceSeries::from_candles(bars);
        Analysis::Ready(self.score(self.indicators(&series)))
    }

    fn should_buy(&self, bars: &[Candle]) -> bool {
        self.analyze(bars).ready().is_some_and(|r| r.buy_signal)
    }

    fn should_sell(&self, bars: &[Candle]) -> bool {
        self.analyze(bars).ready().is_some_and(|r| r.sell_signal)
    }

    fn generate_signal(&self, symbol: &str, bars: &[Candle]) -> Option<TradingSignal> {
        let report = self.analyze(bars).ready()?;
        let (side, confidence) = if report.buy_signal {
            (Side::Buy, report.bullish_score)
        } else if report.sell_signal {
            (Side::Sell, report.bearish_score)
        } else {
            return None;
        };

        let metadata = json!({
            "atr": report.indicators.atr,
            "indicators": &report.indicators,
            "bias": report.bias,
            "rsi_condition": report.rsi_condition,
            "bullish_score": report.bullish_score,
            "bearish_score": report.bearish_score,
            "volume_spike": report.volume_spike,
            "bb_squeeze": report.bb_squeeze,
            "bb_expansion": report.bb_expansion,
            "conditions_met": if side == Side::Buy {
                report.buy_conditions_met
            } else {
                report.sell_conditions_met
            },
        });

        Some(TradingSignal::new(
            symbol,
            side,
            report.signal_strength,
            confidence,
            self.name.clone(),
            metadata,
        ))
    }
}
