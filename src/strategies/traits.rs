// src/strategies/traits.rs
use crate::types::{Candle, TradingSignal};
use serde::Serialize;

/// Outcome of one analysis pass over a bar window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Analysis<T> {
    Ready(T),
    InsufficientData { required: usize, available: usize },
    InvalidData { reason: String },
}

impl<T> Analysis<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Analysis::Ready(report) => Some(report),
            _ => None,
        }
    }
}

pub trait Strategy: Send + Sync {
    /// Indicator snapshot produced by `analyze`.
    type Report: Serialize;

    fn name(&self) -> &str;

    /// Bars needed before `analyze` will produce a report.
    fn required_periods(&self) -> usize;

    fn analyze(&self, bars: &[Candle]) -> Analysis<Self::Report>;

    fn should_buy(&self, bars: &[Candle]) -> bool;

    fn should_sell(&self, bars: &[Candle]) -> bool;

    fn generate_signal(&self, symbol: &str, bars: &[Candle]) -> Option<TradingSignal>;
}

/// Object-safe face of a strategy, which is all the engine needs.
pub trait SignalSource: Send + Sync {
    fn strategy_name(&self) -> &str;

    fn signal(&self, symbol: &str, bars: &[Candle]) -> Option<TradingSignal>;
}

impl<S: Strategy> SignalSource for S {
    fn strategy_name(&self) -> &str {
        self.name()
    }

    fn signal(&self, symbol: &str, bars: &[Candle]) -> Option<TradingSignal> {
        self.generate_signal(symbol, bars)
    }
}

/// Rejects windows that are out of order, duplicated or internally inconsistent.
pub fn validate_window(bars: &[Candle]) -> Result<(), String> {
    for bar in bars {
        if let Some(defect) = bar.defect() {
            return Err(defect);
        }
    }
    for pair in bars.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(format!(
                "timestamps not strictly ascending at {}",
                pair[1].timestamp
            ));
        }
    }
    Ok(())
}

/// Shared gate in front of every `analyze`.
pub fn check_window<T>(bars: &[Candle], required: usize) -> Option<Analysis<T>> {
    if bars.len() < required {
        return Some(Analysis::InsufficientData {
            required,
            available: bars.len(),
        });
    }
    validate_window(bars)
        .err()
        .map(|reason| Analysis::InvalidData { reason })
}
