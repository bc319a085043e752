// src/utils/error_collector.rs
use crate::errors::ErrorCategory;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::error;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
    /// Where it happened, e.g. `fetch_ohlcv binance BTC/USDT`.
    pub context: String,
    pub retried: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub recent: Vec<ErrorRecord>,
}

#[derive(Debug)]
struct Inner {
    records: VecDeque<ErrorRecord>,
    counts: BTreeMap<ErrorCategory, u64>,
    total: u64,
}

/// Bounded error telemetry. Keeps the newest `capacity` records and lifetime
/// counts per category. Built by the process wiring and handed to whoever
/// needs to report.
#[derive(Debug)]
pub struct ErrorCollector {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ErrorCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity.clamp(1, 1024)),
                counts: BTreeMap::new(),
                total: 0,
            }),
        }
    }

    pub fn record(
        &self,
        category: ErrorCategory,
        message: impl Into<String>,
        context: impl Into<String>,
        retried: bool,
    ) {
        let record = ErrorRecord {
            at: Utc::now(),
            category,
            message: message.into(),
            context: context.into(),
            retried,
        };
        error!(
            category = %record.category,
            context = %record.context,
            retried = record.retried,
            "Error recorded: {}",
            record.message
        );

        let mut inner = self.inner.lock();
        if inner.records.len() == self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record);
        *inner.counts.entry(category).or_insert(0) += 1;
        inner.total += 1;
    }

    /// Lifetime counts plus the newest `recent` records, oldest first.
    pub fn summary(&self, recent: usize) -> ErrorSummary {
        let inner = self.inner.lock();
        let skip = inner.records.len().saturating_sub(recent);
        ErrorSummary {
            total: inner.total,
            by_category: inner.counts.clone(),
            recent: inner.records.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.inner.lock().counts.get(&category).copied().unwrap_or(0)
    }

    pub fn retained(&self) -> usize {
        self.inner.lock().records.len()
    }
}

impl Default for ErrorCollector {
    fn default() -> Self {
        Self::new(1_000)
    }
}
