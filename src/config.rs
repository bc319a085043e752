// src/config.rs

use crate::types::Exchange;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    pub poll_interval_ms: u64,
    pub timeframe: String,
    pub ohlcv_limit: usize,
    pub max_concurrent_orders: usize,
    /// Opposing signals must be strictly more confident than this to close.
    pub close_confidence_threshold: f64,
    pub trade_history_limit: usize,
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            timeframe: "1h".to_string(),
            ohlcv_limit: 200,
            max_concurrent_orders: 5,
            close_confidence_threshold: 0.7,
            trade_history_limit: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskSettings {
    pub default_quote_asset: String,
    pub risk_percentage: Decimal,
    pub stop_multiplier: Decimal,
    pub default_stop_pct: Decimal,
    pub risk_reward_ratio: Decimal,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            default_quote_asset: "USDT".to_string(),
            risk_percentage: Decimal::new(2, 2),
            stop_multiplier: Decimal::TWO,
            default_stop_pct: Decimal::new(2, 2),
            risk_reward_ratio: Decimal::TWO,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ErrorSettings {
    /// How many error records the collector keeps.
    pub capacity: usize,
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StartingBalance {
    pub exchange: Exchange,
    pub asset: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaperMarket {
    pub exchange: Exchange,
    pub symbol: String,
    pub start_price: Decimal,
    /// Bars generated up front so strategies have history on the first pass.
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_history() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaperSettings {
    pub fee_rate: Decimal,
    pub seed: u64,
    /// Per-bar volatility of the random-walk feed, as a fraction of price.
    pub volatility: f64,
    pub starting_balances: Vec<StartingBalance>,
    pub markets: Vec<PaperMarket>,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(1, 3),
            seed: 7,
            volatility: 0.01,
            starting_balances: Vec::new(),
            markets: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyEntry {
    pub name: String,
    pub kind: String,
    pub symbols: Vec<String>,
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub risk: RiskSettings,
    pub retry: RetrySettings,
    pub errors: ErrorSettings,
    pub logging: LogSettings,
    pub paper: PaperSettings,
    pub strategies: Vec<StrategyEntry>,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }
}
