// src/connectors/paper.rs
//! In-memory exchange for paper trading and tests. Fills market orders at the
//! last price, charges a quote-currency fee and keeps balances per venue.

use crate::config::PaperSettings;
use crate::connectors::traits::ExchangeClient;
use crate::errors::ExchangeError;
use crate::types::{
    Balance, BalanceKey, Candle, Exchange, Order, OrderRequest, OrderStatus, OrderType,
    PositionKey, Side, Ticker, Trade,
};
use crate::utils::symbol::split_symbol;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Market orders come back `CLOSED` from `place_order`.
    Immediate,
    /// Orders stay `OPEN` until `fill_order` is called.
    Resting,
}

#[derive(Debug, Default)]
struct Market {
    candles: Vec<Candle>,
    last: Decimal,
    /// Appends one random-walk bar on every OHLCV fetch.
    walking: bool,
}

#[derive(Debug)]
struct Venue {
    markets: BTreeMap<PositionKey, Market>,
    balances: BTreeMap<BalanceKey, Decimal>,
    orders: BTreeMap<String, Order>,
    trades: Vec<Trade>,
    placed: Vec<OrderRequest>,
    ohlcv_failures: BTreeMap<PositionKey, VecDeque<ExchangeError>>,
    cancel_failures: HashSet<String>,
    ohlcv_calls: usize,
    rng: StdRng,
}

pub struct PaperExchange {
    exchanges: Vec<Exchange>,
    fee_rate: Decimal,
    volatility: f64,
    fill_mode: Mutex<FillMode>,
    venue: Mutex<Venue>,
}

impl PaperExchange {
    pub fn new(exchanges: Vec<Exchange>) -> Self {
        let defaults = PaperSettings::default();
        Self::with_parameters(exchanges, defaults.fee_rate, defaults.volatility, defaults.seed)
    }

    pub fn with_parameters(
        exchanges: Vec<Exchange>,
        fee_rate: Decimal,
        volatility: f64,
        seed: u64,
    ) -> Self {
        // Used as a symmetric sampling range, so it has to be finite and non-negative.
        let volatility = if volatility.is_finite() { volatility.abs() } else { 0.0 };
        Self {
            exchanges,
            fee_rate,
            volatility,
            fill_mode: Mutex::new(FillMode::Immediate),
            venue: Mutex::new(Venue {
                markets: BTreeMap::new(),
                balances: BTreeMap::new(),
                orders: BTreeMap::new(),
                trades: Vec::new(),
                placed: Vec::new(),
                ohlcv_failures: BTreeMap::new(),
                cancel_failures: HashSet::new(),
                ohlcv_calls: 0,
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Venues, balances and random-walk markets from the `[paper]` section.
    pub fn from_settings(settings: &PaperSettings) -> Self {
        let mut exchanges: Vec<Exchange> = Vec::new();
        let mentioned = settings
            .starting_balances
            .iter()
            .map(|b| b.exchange)
            .chain(settings.markets.iter().map(|m| m.exchange));
        for exchange in mentioned {
            if !exchanges.contains(&exchange) {
                exchanges.push(exchange);
            }
        }

        let paper = Self::with_parameters(
            exchanges,
            settings.fee_rate,
            settings.volatility,
            settings.seed,
        );
        for balance in &settings.starting_balances {
            paper.set_balance(balance.exchange, &balance.asset, balance.amount);
        }
        for market in &settings.markets {
            paper.seed_random_walk(market.exchange, &market.symbol, market.start_price, market.history);
        }
        paper
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        *self.fill_mode.lock() = mode;
    }

    pub fn set_balance(&self, exchange: Exchange, asset: &str, amount: Decimal) {
        self.venue
            .lock()
            .balances
            .insert(BalanceKey::new(exchange, asset.to_ascii_uppercase()), amount);
    }

    pub fn free_balance(&self, exchange: Exchange, asset: &str) -> Decimal {
        self.venue
            .lock()
            .balances
            .get(&BalanceKey::new(exchange, asset.to_ascii_uppercase()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Moves the last traded price; creates the market if needed.
    pub fn set_price(&self, exchange: Exchange, symbol: &str, price: Decimal) {
        let mut venue = self.venue.lock();
        venue
            .markets
            .entry(PositionKey::new(exchange, symbol))
            .or_default()
            .last = price;
    }

    /// Replaces the bar history; the last close becomes the last price.
    pub fn set_candles(&self, exchange: Exchange, symbol: &str, candles: Vec<Candle>) {
        let mut venue = self.venue.lock();
        let market = venue
            .markets
            .entry(PositionKey::new(exchange, symbol))
            .or_default();
        if let Some(bar) = candles.last() {
            market.last = bar.close;
        }
        market.candles = candles;
        market.walking = false;
    }

    /// Seeds `history` hourly bars ending now and keeps the walk going on
    /// every subsequent fetch.
    pub fn seed_random_walk(&self, exchange: Exchange, symbol: &str, start_price: Decimal, history: usize) {
        let mut venue = self.venue.lock();
        let venue = &mut *venue;
        let start = Utc::now() - Duration::hours(history as i64);
        let mut candles = Vec::with_capacity(history);
        let mut previous = start_price;
        for i in 0..history {
            let bar = walk_bar(&mut venue.rng, self.volatility, previous, start + Duration::hours(i as i64));
            previous = bar.close;
            candles.push(bar);
        }
        venue.markets.insert(
            PositionKey::new(exchange, symbol),
            Market {
                candles,
                last: previous,
                walking: true,
            },
        );
        info!(%exchange, symbol, bars = history, "Paper market seeded");
    }

    /// Queues an error for the next OHLCV fetch of this pair.
    pub fn fail_next_ohlcv(&self, exchange: Exchange, symbol: &str, error: ExchangeError) {
        self.venue
            .lock()
            .ohlcv_failures
            .entry(PositionKey::new(exchange, symbol))
            .or_default()
            .push_back(error);
    }

    /// Every cancellation of `order_id` fails with a network error.
    pub fn fail_cancel(&self, order_id: &str) {
        self.venue.lock().cancel_failures.insert(order_id.to_string());
    }

    /// Every request received, accepted or not.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.venue.lock().placed.clone()
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.venue.lock().orders.get(order_id).cloned()
    }

    pub fn ohlcv_calls(&self) -> usize {
        self.venue.lock().ohlcv_calls
    }

    /// Fills a resting order at the current price.
    pub fn fill_order(&self, order_id: &str) -> Result<Order, ExchangeError> {
        let mut venue = self.venue.lock();
        let Some(order) = venue.orders.get(order_id).cloned() else {
            return Err(ExchangeError::OrderNotFound {
                exchange: self.exchanges.first().copied().unwrap_or(Exchange::Binance),
                order_id: order_id.to_string(),
            });
        };
        if order.status.is_terminal() {
            return Err(ExchangeError::InvalidOrder {
                exchange: order.exchange,
                message: format!("order {order_id} is already {:?}", order.status),
            });
        }
        let filled = self.execute(&mut venue, order)?;
        venue.orders.insert(filled.id.clone(), filled.clone());
        Ok(filled)
    }

    fn ensure_managed(&self, exchange: Exchange) -> Result<(), ExchangeError> {
        if self.exchanges.contains(&exchange) {
            Ok(())
        } else {
            Err(ExchangeError::Other {
                exchange,
                message: "venue not configured for paper trading".to_string(),
            })
        }
    }

    fn market_price(venue: &Venue, exchange: Exchange, symbol: &str) -> Result<Decimal, ExchangeError> {
        venue
            .markets
            .get(&PositionKey::new(exchange, symbol))
            .map(|m| m.last)
            .filter(|price| *price > Decimal::ZERO)
            .ok_or_else(|| ExchangeError::SymbolNotFound {
                exchange,
                symbol: symbol.to_string(),
            })
    }

    /// Settles `order` at the last price and books the trade.
    fn execute(&self, venue: &mut Venue, mut order: Order) -> Result<Order, ExchangeError> {
        let price = match order.order_type {
            OrderType::Limit => order.price.unwrap_or_default(),
            OrderType::Market => Self::market_price(venue, order.exchange, &order.symbol)?,
        };
        let (base, quote) = split_symbol(&order.symbol).ok_or_else(|| ExchangeError::SymbolNotFound {
            exchange: order.exchange,
            symbol: order.symbol.clone(),
        })?;
        let quote_key = BalanceKey::new(order.exchange, quote.clone());
        let base_key = BalanceKey::new(order.exchange, base);

        let notional = order.amount * price;
        let fee = notional * self.fee_rate;
        let free_quote = venue.balances.get(&quote_key).copied().unwrap_or(Decimal::ZERO);

        match order.side {
            Side::Buy => {
                if notional + fee > free_quote {
                    return Err(ExchangeError::InsufficientBalance {
                        exchange: order.exchange,
                        message: format!(
                            "need {} {quote}, have {free_quote}",
                            (notional + fee).round_dp(8)
                        ),
                    });
                }
                *venue.balances.entry(quote_key).or_default() -= notional + fee;
                *venue.balances.entry(base_key).or_default() += order.amount;
            }
            // Sells are not balance-checked so the venue can carry shorts.
            Side::Sell => {
                *venue.balances.entry(quote_key).or_default() += notional - fee;
                *venue.balances.entry(base_key).or_default() -= order.amount;
            }
        }

        let now = Utc::now();
        order.price = Some(price);
        order.filled = order.amount;
        order.remaining = Decimal::ZERO;
        order.status = OrderStatus::Closed;
        order.timestamp = now;

        venue.trades.push(Trade {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            exchange: order.exchange,
            side: order.side,
            amount: order.amount,
            price,
            fee,
            fee_currency: quote,
            timestamp: now,
        });
        debug!(order_id = %order.id, %price, %fee, "Paper fill");
        Ok(order)
    }
}

/// One random-walk bar opening at `previous`.
fn walk_bar(rng: &mut StdRng, volatility: f64, previous: Decimal, timestamp: chrono::DateTime<Utc>) -> Candle {
    let step = rng.gen_range(-volatility..=volatility);
    let wick = rng.gen_range(0.0..=volatility / 2.0);
    let factor = |x: f64| Decimal::from_f64(x).unwrap_or(Decimal::ONE);

    let open = previous;
    let close = (previous * factor(1.0 + step)).round_dp(8);
    let high = (open.max(close) * factor(1.0 + wick)).round_dp(8);
    let low = (open.min(close) * factor(1.0 - wick)).round_dp(8);
    let volume = Decimal::from_f64(rng.gen_range(500.0..1_500.0))
        .unwrap_or_else(|| Decimal::from(1_000))
        .round_dp(4);

    Candle {
        timestamp,
        open,
        high,
        low,
        close,
        volume,
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.clone()
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        exchange: Exchange,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.ensure_managed(exchange)?;
        let mut venue = self.venue.lock();
        let venue = &mut *venue;
        venue.ohlcv_calls += 1;

        let key = PositionKey::new(exchange, symbol);
        if let Some(error) = venue.ohlcv_failures.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        let Some(market) = venue.markets.get_mut(&key) else {
            return Err(ExchangeError::SymbolNotFound {
                exchange,
                symbol: symbol.to_string(),
            });
        };

        if market.walking {
            if let Some(last) = market.candles.last() {
                let bar = walk_bar(&mut venue.rng, self.volatility, last.close, last.timestamp + Duration::hours(1));
                market.last = bar.close;
                market.candles.push(bar);
            }
        }
        let skip = market.candles.len().saturating_sub(limit);
        Ok(market.candles[skip..].to_vec())
    }

    async fn fetch_ticker(&self, symbol: &str, exchange: Exchange) -> Result<Ticker, ExchangeError> {
        self.ensure_managed(exchange)?;
        let venue = self.venue.lock();
        let last = Self::market_price(&venue, exchange, symbol)?;
        let market = venue.markets.get(&PositionKey::new(exchange, symbol));
        let candles = market.map(|m| m.candles.as_slice()).unwrap_or_default();

        let previous = candles
            .len()
            .checked_sub(2)
            .map(|i| candles[i].close)
            .unwrap_or(last);
        let change = last - previous;
        let percentage = if previous.is_zero() {
            Decimal::ZERO
        } else {
            change / previous * Decimal::ONE_HUNDRED
        };

        Ok(Ticker {
            symbol: symbol.to_string(),
            bid: last,
            ask: last,
            last,
            volume: candles.last().map(|c| c.volume).unwrap_or_default(),
            change,
            percentage,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_balance(&self, exchange: Exchange) -> Result<Vec<Balance>, ExchangeError> {
        self.ensure_managed(exchange)?;
        let venue = self.venue.lock();
        Ok(venue
            .balances
            .iter()
            .filter(|(key, _)| key.exchange == exchange)
            .map(|(key, free)| Balance::new(exchange, key.asset.clone(), *free, Decimal::ZERO))
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        self.ensure_managed(request.exchange)?;
        let mode = *self.fill_mode.lock();
        let mut venue = self.venue.lock();
        venue.placed.push(request.clone());

        if request.amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder {
                exchange: request.exchange,
                message: format!("amount must be positive, got {}", request.amount),
            });
        }
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(ExchangeError::InvalidOrder {
                exchange: request.exchange,
                message: "limit order without price".to_string(),
            });
        }

        let order = Order {
            id: Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            exchange: request.exchange,
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: Decimal::ZERO,
            remaining: request.amount,
            status: OrderStatus::Open,
            timestamp: Utc::now(),
        };

        let order = match (mode, request.order_type) {
            (FillMode::Immediate, OrderType::Market) => self.execute(&mut venue, order)?,
            _ => {
                // Resting orders still need a quoted market.
                Self::market_price(&venue, order.exchange, &order.symbol)?;
                order
            }
        };
        venue.orders.insert(order.id.clone(), order.clone());
        info!(
            order_id = %order.id,
            exchange = %order.exchange,
            symbol = %order.symbol,
            side = %order.side,
            amount = %order.amount,
            status = ?order.status,
            "Paper order accepted"
        );
        Ok(order)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _symbol: &str,
        exchange: Exchange,
    ) -> Result<Order, ExchangeError> {
        let mut venue = self.venue.lock();
        if venue.cancel_failures.contains(order_id) {
            return Err(ExchangeError::Network {
                exchange,
                message: format!("cancel {order_id} timed out"),
            });
        }
        let Some(order) = venue.orders.get_mut(order_id) else {
            return Err(ExchangeError::OrderNotFound {
                exchange,
                order_id: order_id.to_string(),
            });
        };
        if order.status.is_terminal() {
            return Err(ExchangeError::InvalidOrder {
                exchange,
                message: format!("order {order_id} is already {:?}", order.status),
            });
        }
        order.status = OrderStatus::Canceled;
        order.timestamp = Utc::now();
        Ok(order.clone())
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        _symbol: &str,
        exchange: Exchange,
    ) -> Result<Order, ExchangeError> {
        self.venue
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound {
                exchange,
                order_id: order_id.to_string(),
            })
    }

    async fn fetch_trades(
        &self,
        exchange: Exchange,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Trade>, ExchangeError> {
        self.ensure_managed(exchange)?;
        let venue = self.venue.lock();
        let matching: Vec<Trade> = venue
            .trades
            .iter()
            .filter(|t| t.exchange == exchange && symbol.map_or(true, |s| t.symbol == s))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching[skip..].to_vec())
    }
}
