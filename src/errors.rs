// src/errors.rs
use crate::types::Exchange;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Buckets used by the error collector and for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Authentication,
    InsufficientBalance,
    InvalidOrder,
    SymbolNotFound,
    OrderNotFound,
    MarketClosed,
    Exchange,
    Strategy,
    Engine,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::InsufficientBalance => "insufficient_balance",
            ErrorCategory::InvalidOrder => "invalid_order",
            ErrorCategory::SymbolNotFound => "symbol_not_found",
            ErrorCategory::OrderNotFound => "order_not_found",
            ErrorCategory::MarketClosed => "market_closed",
            ErrorCategory::Exchange => "exchange",
            ErrorCategory::Strategy => "strategy",
            ErrorCategory::Engine => "engine",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("{exchange}: network error: {message}")]
    Network { exchange: Exchange, message: String },

    #[error("{exchange}: rate limited (retry after {retry_after:?})")]
    RateLimited {
        exchange: Exchange,
        retry_after: Option<Duration>,
    },

    #[error("{exchange}: authentication failed: {message}")]
    Authentication { exchange: Exchange, message: String },

    #[error("{exchange}: insufficient balance: {message}")]
    InsufficientBalance { exchange: Exchange, message: String },

    #[error("{exchange}: invalid order: {message}")]
    InvalidOrder { exchange: Exchange, message: String },

    #[error("{exchange}: symbol not found: {symbol}")]
    SymbolNotFound { exchange: Exchange, symbol: String },

    #[error("{exchange}: order not found: {order_id}")]
    OrderNotFound { exchange: Exchange, order_id: String },

    #[error("{exchange}: market closed for {symbol}")]
    MarketClosed { exchange: Exchange, symbol: String },

    #[error("{exchange}: {message}")]
    Other { exchange: Exchange, message: String },
}

impl ExchangeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExchangeError::Network { .. } => ErrorCategory::Network,
            ExchangeError::RateLimited { .. } => ErrorCategory::RateLimit,
            ExchangeError::Authentication { .. } => ErrorCategory::Authentication,
            ExchangeError::InsufficientBalance { .. } => ErrorCategory::InsufficientBalance,
            ExchangeError::InvalidOrder { .. } => ErrorCategory::InvalidOrder,
            ExchangeError::SymbolNotFound { .. } => ErrorCategory::SymbolNotFound,
            ExchangeError::OrderNotFound { .. } => ErrorCategory::OrderNotFound,
            ExchangeError::MarketClosed { .. } => ErrorCategory::MarketClosed,
            ExchangeError::Other { .. } => ErrorCategory::Exchange,
        }
    }

    /// Only connectivity and throttling failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network { .. } | ExchangeError::RateLimited { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid parameter for {strategy}: {message}")]
    InvalidParameter { strategy: String, message: String },

    #[error("unknown strategy kind: {0}")]
    UnknownKind(String),

    #[error("malformed parameters for {kind}: {source}")]
    MalformedParams {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("no managed exchange lists symbol {0}")]
    UnmanagedSymbol(String),

    #[error("engine is already {0}")]
    AlreadyActive(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Exchange(e) => e.category(),
            EngineError::UnmanagedSymbol(_) | EngineError::AlreadyActive(_) => ErrorCategory::Engine,
        }
    }
}
