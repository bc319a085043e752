// src/types.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Closed,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// The exchange will not change the order any further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Closed | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// Venues the engine can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Upbit,
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
            Exchange::Upbit => write!(f, "upbit"),
        }
    }
}

/// Identity of a position: at most one per (exchange, symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PositionKey {
    pub exchange: Exchange,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(exchange: Exchange, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
        }
    }
}

/// Identity of a balance: one per (exchange, asset).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BalanceKey {
    pub exchange: Exchange,
    pub asset: String,
}

impl BalanceKey {
    pub fn new(exchange: Exchange, asset: impl Into<String>) -> Self {
        Self {
            exchange,
            asset: asset.into(),
        }
    }
}

/// One OHLCV bar. Windows are ordered by ascending timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Describes the first inconsistency in the bar, if any.
    pub fn defect(&self) -> Option<String> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Some(format!("non-positive price in bar at {}", self.timestamp));
        }
        if self.high < self.low {
            return Some(format!(
                "high {} below low {} at {}",
                self.high, self.low, self.timestamp
            ));
        }
        if self.volume < Decimal::ZERO {
            return Some(format!("negative volume at {}", self.timestamp));
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    pub change: Decimal,
    pub percentage: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A strategy's directional recommendation. Built once per analysis pass.
#[derive(Debug, Clone, Serialize)]
pub struct TradingSignal {
    pub symbol: String,
    pub side: Side,
    pub strength: f64,
    pub confidence: f64,
    pub strategy: String,
    pub metadata: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

impl TradingSignal {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        strength: f64,
        confidence: f64,
        strategy: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            strength: unit_interval(strength),
            confidence: unit_interval(confidence),
            strategy: strategy.into(),
            metadata,
            generated_at: Utc::now(),
        }
    }

    /// Ranking key used when more signals arrive than order slots.
    pub fn priority(&self) -> f64 {
        self.strength * self.confidence
    }
}

fn unit_interval(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Net open exposure on one exchange/symbol. `size` is always positive while
/// the position is held by the portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub market_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.exchange, self.symbol.clone())
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        let diff = self.market_price - self.entry_price;
        match self.side {
            Side::Buy => diff * self.size,
            Side::Sell => -diff * self.size,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.market_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub exchange: Exchange,
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(exchange: Exchange, asset: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            asset: asset.into(),
            exchange,
            free,
            locked,
            total: free + locked,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.exchange, self.asset.clone())
    }
}

/// What the engine asks an exchange to do. The exchange answers with an `Order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, exchange: Exchange, side: Side, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        exchange: Exchange,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
        }
    }
}

/// Exchange-side view of an order. Only refreshed from the exchange, never
/// edited locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
}

/// Derived on demand by the portfolio manager; never cached.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub total_value: Decimal,
    pub total_pnl: Decimal,
    pub available_balance: Decimal,
    pub positions: Vec<Position>,
    pub generated_at: DateTime<Utc>,
}
