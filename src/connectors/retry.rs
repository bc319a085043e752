// src/connectors/retry.rs
use crate::config::RetrySettings;
use crate::connectors::traits::ExchangeClient;
use crate::errors::ExchangeError;
use crate::types::{Balance, Candle, Exchange, Order, OrderRequest, Ticker, Trade};
use crate::utils::error_collector::ErrorCollector;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff: settings.backoff.max(1.0),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based): `base × backoff^(attempt-1)`, scaled into [0.5, 1.0) when
    /// jitter is on, raised to any `retry_after` hint, then capped.
    pub fn delay_for(&self, attempt: u32, error: &ExchangeError) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let mut millis = self.base_delay.as_millis() as f64 * self.backoff.powi(exponent);
        if self.jitter {
            millis *= rand::thread_rng().gen_range(0.5..1.0);
        }
        let mut delay = Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64);
        if let ExchangeError::RateLimited {
            retry_after: Some(hint),
            ..
        } = error
        {
            delay = delay.max(*hint);
        }
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Wraps any client with bounded retries for transient failures. Everything
/// else is returned on the first attempt. Final failures land in the error
/// collector.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    errors: Arc<ErrorCollector>,
}

impl<C: ExchangeClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy, errors: Arc<ErrorCollector>) -> Self {
        Self {
            inner,
            policy,
            errors,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn call<T, F, Fut>(&self, context: String, op: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, ExchangeError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                self.errors
                    .record(error.category(), error.to_string(), context, false);
                return Err(error);
            }
            if attempt >= self.policy.max_attempts {
                self.errors
                    .record(error.category(), error.to_string(), context, true);
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt, &error);
            warn!(
                context = %context,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Transient exchange error, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<C: ExchangeClient> ExchangeClient for RetryingClient<C> {
    fn exchanges(&self) -> Vec<Exchange> {
        self.inner.exchanges()
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        exchange: Exchange,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.call(format!("fetch_ohlcv {exchange} {symbol}"), || {
            self.inner.fetch_ohlcv(symbol, exchange, timeframe, limit)
        })
        .await
    }

    async fn fetch_ticker(&self, symbol: &str, exchange: Exchange) -> Result<Ticker, ExchangeError> {
        self.call(format!("fetch_ticker {exchange} {symbol}"), || {
            self.inner.fetch_ticker(symbol, exchange)
        })
        .await
    }

    async fn fetch_balance(&self, exchange: Exchange) -> Result<Vec<Balance>, ExchangeError> {
        self.call(format!("fetch_balance {exchange}"), || {
            self.inner.fetch_balance(exchange)
        })
        .await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let context = format!(
            "place_order {} {} {} {}",
            request.exchange, request.symbol, request.side, request.amount
        );
        self.call(context, || self.inner.place_order(request)).await
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Order, ExchangeError> {
        self.call(format!("cancel_order {exchange} {symbol} {order_id}"), || {
            self.inner.cancel_order(order_id, symbol, exchange)
        })
        .await
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Order, ExchangeError> {
        self.call(format!("fetch_order {exchange} {symbol} {order_id}"), || {
            self.inner.fetch_order(order_id, symbol, exchange)
        })
        .await
    }

    async fn fetch_trades(
        &self,
        exchange: Exchange,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Trade>, ExchangeError> {
        self.call(format!("fetch_trades {exchange}"), || {
            self.inner.fetch_trades(exchange, symbol, limit)
        })
        .await
    }
}
