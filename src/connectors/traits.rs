// src/connectors/traits.rs
use crate::errors::ExchangeError;
use crate::types::{Balance, Candle, Exchange, Order, OrderRequest, Ticker, Trade};
use async_trait::async_trait;

/// Everything the engine needs from an exchange. Implementations own the wire
/// protocol, authentication and per-call timeouts.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Venues this client can route to.
    fn exchanges(&self) -> Vec<Exchange>;

    /// Bars in ascending timestamp order, at most `limit` of them.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        exchange: Exchange,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str, exchange: Exchange) -> Result<Ticker, ExchangeError>;

    async fn fetch_balance(&self, exchange: Exchange) -> Result<Vec<Balance>, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Order, ExchangeError>;

    async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Order, ExchangeError>;

    /// Most recent trades first or last is up to the venue; callers sort.
    async fn fetch_trades(
        &self,
        exchange: Exchange,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Trade>, ExchangeError>;
}
