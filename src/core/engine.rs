// src/core/engine.rs
use crate::config::EngineSettings;
use crate::connectors::traits::ExchangeClient;
use crate::core::portfolio::PortfolioManager;
use crate::errors::{EngineError, ExchangeError};
use crate::strategies::traits::SignalSource;
use crate::types::{Exchange, Order, OrderRequest, PortfolioSummary, Position, TradingSignal};
use crate::utils::error_collector::ErrorCollector;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub running: bool,
    pub strategies: Vec<String>,
    pub active_symbols: Vec<(Exchange, Vec<String>)>,
    pub in_flight_order_count: usize,
    pub poll_interval_ms: u64,
}

/// Counters for one pass of the poll loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationReport {
    pub pairs_scanned: usize,
    pub pairs_skipped: usize,
    pub signals: usize,
    pub orders_placed: usize,
    pub orders_completed: usize,
}

struct RegisteredStrategy {
    name: String,
    source: Arc<dyn SignalSource>,
    symbols: Vec<String>,
    exchanges: Vec<Exchange>,
}

/// Drives strategies against market data and routes their signals to the
/// exchange. One sequential loop; iterations never overlap.
pub struct TradingEngine {
    client: Arc<dyn ExchangeClient>,
    portfolio: Arc<PortfolioManager>,
    errors: Arc<ErrorCollector>,
    settings: EngineSettings,
    strategies: RwLock<Vec<RegisteredStrategy>>,
    active_symbols: RwLock<Vec<(Exchange, Vec<String>)>>,
    in_flight: Mutex<BTreeMap<String, Order>>,
    state: watch::Sender<EngineState>,
    stop_requested: AtomicBool,
    wake: Notify,
}

impl TradingEngine {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        portfolio: Arc<PortfolioManager>,
        errors: Arc<ErrorCollector>,
        settings: EngineSettings,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            client,
            portfolio,
            errors,
            settings,
            strategies: RwLock::new(Vec::new()),
            active_symbols: RwLock::new(Vec::new()),
            in_flight: Mutex::new(BTreeMap::new()),
            state,
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn portfolio(&self) -> &Arc<PortfolioManager> {
        &self.portfolio
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Registers (or replaces) a strategy and the pairs it wants scanned.
    pub fn add_strategy(
        &self,
        name: impl Into<String>,
        source: Arc<dyn SignalSource>,
        symbols: Vec<String>,
        exchanges: Vec<Exchange>,
    ) {
        let name = name.into();
        let served = self.client.exchanges();
        for exchange in exchanges.iter().filter(|e| !served.contains(*e)) {
            warn!(strategy = %name, %exchange, "Exchange client does not serve this venue");
        }
        info!(
            strategy = %name,
            symbols = symbols.len(),
            exchanges = exchanges.len(),
            "Strategy added"
        );
        let mut strategies = self.strategies.write();
        strategies.retain(|s| s.name != name);
        strategies.push(RegisteredStrategy {
            name,
            source,
            symbols,
            exchanges,
        });
        *self.active_symbols.write() = active_symbols_of(&strategies);
    }

    pub fn remove_strategy(&self, name: &str) -> bool {
        let mut strategies = self.strategies.write();
        let before = strategies.len();
        strategies.retain(|s| s.name != name);
        let removed = strategies.len() != before;
        if removed {
            *self.active_symbols.write() = active_symbols_of(&strategies);
            info!(strategy = %name, "Strategy removed");
        }
        removed
    }

    /// Runs the poll loop until `stop` is called. Returns once the engine is
    /// back in `Stopped`, after outstanding orders were cancelled.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == EngineState::Stopped {
                *state = EngineState::Starting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return Err(EngineError::AlreadyActive(self.state().to_string()));
        }

        info!("Engine starting...");
        self.bootstrap().await;
        self.state.send_replace(EngineState::Running);
        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            "Engine loop running"
        );

        while !self.stop_requested.load(Ordering::SeqCst) {
            match self.run_iteration().await {
                Ok(report) => debug!(?report, "Iteration finished"),
                Err(e) => self.report_error(&e, "trading loop"),
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.state.send_replace(EngineState::Stopping);
        info!("Engine stopping, cancelling outstanding orders");
        self.cancel_all_orders().await;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.state.send_replace(EngineState::Stopped);
        info!("Engine stopped");
        Ok(())
    }

    /// Asks the loop to finish its current iteration and waits until the
    /// engine is stopped. On an idle engine this just cancels in-flight orders.
    pub async fn stop(&self) {
        let mut state = self.state.subscribe();
        if *state.borrow() == EngineState::Stopped {
            self.cancel_all_orders().await;
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        if state.wait_for(|s| *s == EngineState::Stopped).await.is_err() {
            warn!("Engine state channel closed while stopping");
        }
    }

    async fn bootstrap(&self) {
        for exchange in self.managed_exchanges() {
            if let Err(e) = self.refresh_balances(exchange).await {
                self.report_error(&e.into(), &format!("bootstrap balances {exchange}"));
            }
        }
        if let Err(e) = self.sync_portfolio().await {
            self.report_error(&e, "bootstrap positions");
        }
    }

    /// One full pass: scan, filter, execute, poll orders, reconcile.
    pub async fn run_iteration(&self) -> Result<IterationReport, EngineError> {
        debug!("Iteration starting");
        let mut report = IterationReport::default();

        let signals = self.collect_signals(&mut report).await;
        report.signals = signals.len();
        if !signals.is_empty() {
            info!(count = signals.len(), "Signals generated");
        }
        report.orders_placed = self.process_signals(signals).await.len();
        report.orders_completed = self.refresh_orders().await;
        self.sync_portfolio().await?;
        Ok(report)
    }

    async fn collect_signals(&self, report: &mut IterationReport) -> Vec<TradingSignal> {
        let strategies: Vec<Arc<dyn SignalSource>> = self
            .strategies
            .read()
            .iter()
            .map(|s| s.source.clone())
            .collect();
        let pairs = self.active_symbols.read().clone();

        let mut signals = Vec::new();
        for (exchange, symbols) in pairs {
            for symbol in symbols {
                report.pairs_scanned += 1;
                let bars = match self
                    .client
                    .fetch_ohlcv(&symbol, exchange, &self.settings.timeframe, self.settings.ohlcv_limit)
                    .await
                {
                    Ok(bars) if !bars.is_empty() => bars,
                    Ok(_) => {
                        warn!(%exchange, %symbol, "No bars returned, skipping pair");
                        report.pairs_skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(%exchange, %symbol, "Market data fetch failed, skipping pair: {}", e);
                        report.pairs_skipped += 1;
                        continue;
                    }
                };

                for source in &strategies {
                    if let Some(signal) = source.signal(&symbol, &bars) {
                        debug!(
                            %exchange,
                            %symbol,
                            strategy = source.strategy_name(),
                            side = %signal.side,
                            strength = signal.strength,
                            confidence = signal.confidence,
                            "Signal"
                        );
                        signals.push(signal);
                    }
                }
            }
        }
        signals
    }

    /// Drops signals for symbols with an order in flight, ranks the rest by
    /// strength × confidence and keeps as many as there are free order slots.
    pub fn filter_signals(&self, signals: Vec<TradingSignal>) -> Vec<TradingSignal> {
        let in_flight = self.in_flight.lock();
        let busy: HashSet<&str> = in_flight.values().map(|o| o.symbol.as_str()).collect();
        let slots = self
            .settings
            .max_concurrent_orders
            .saturating_sub(in_flight.len());
        prioritize(signals, &busy, slots)
    }

    /// Filters then executes each signal. Failures are logged per signal and
    /// never abort the batch. Returns the orders placed.
    pub async fn process_signals(&self, signals: Vec<TradingSignal>) -> Vec<Order> {
        let mut placed = Vec::new();
        for signal in self.filter_signals(signals) {
            match self.execute_signal(&signal).await {
                Ok(Some(order)) => placed.push(order),
                Ok(None) => {}
                Err(e) => self.report_error(&e, &format!("execute {} {}", signal.side, signal.symbol)),
            }
        }
        placed
    }

    /// Resolves the venue, sizes the trade and either opens a position or
    /// closes an opposing one.
    pub async fn execute_signal(&self, signal: &TradingSignal) -> Result<Option<Order>, EngineError> {
        let exchange = self
            .resolve_exchange(&signal.symbol)
            .ok_or_else(|| EngineError::UnmanagedSymbol(signal.symbol.clone()))?;

        let ticker = self.client.fetch_ticker(&signal.symbol, exchange).await?;
        let price = ticker.last;
        self.portfolio.record_mark_price(exchange, &signal.symbol, price);

        let size = self
            .portfolio
            .calculate_position_size(&signal.symbol, exchange, price, signal.strength);
        if size <= Decimal::ZERO {
            warn!(%exchange, symbol = %signal.symbol, "Position size is zero, skipping signal");
            return Ok(None);
        }

        match self.portfolio.get_position(exchange, &signal.symbol) {
            Some(position) => self.handle_existing_position(signal, position).await,
            None => self.open_position(signal, exchange, size, price).await,
        }
    }

    async fn handle_existing_position(
        &self,
        signal: &TradingSignal,
        position: Position,
    ) -> Result<Option<Order>, EngineError> {
        if position.side == signal.side {
            debug!(symbol = %signal.symbol, "Signal agrees with open position, nothing to do");
            return Ok(None);
        }
        if signal.confidence <= self.settings.close_confidence_threshold {
            info!(
                symbol = %signal.symbol,
                confidence = signal.confidence,
                threshold = self.settings.close_confidence_threshold,
                "Opposing signal too weak to close position"
            );
            return Ok(None);
        }

        let request = OrderRequest::market(
            position.symbol.clone(),
            position.exchange,
            position.side.opposite(),
            position.size,
        );
        let order = self.client.place_order(&request).await?;
        info!(
            order_id = %order.id,
            exchange = %position.exchange,
            symbol = %position.symbol,
            side = %request.side,
            amount = %request.amount,
            "Closing position"
        );
        self.track(order.clone());
        Ok(Some(order))
    }

    async fn open_position(
        &self,
        signal: &TradingSignal,
        exchange: Exchange,
        size: Decimal,
        price: Decimal,
    ) -> Result<Option<Order>, EngineError> {
        let request = OrderRequest::market(signal.symbol.clone(), exchange, signal.side, size);
        if !self.portfolio.check_risk_limits(&request) {
            warn!(%exchange, symbol = %signal.symbol, %size, "Risk limits rejected order");
            return Ok(None);
        }

        let atr = signal
            .metadata
            .get("atr")
            .and_then(serde_json::Value::as_f64)
            .and_then(Decimal::from_f64)
            .filter(|atr| *atr > Decimal::ZERO);
        let stop_loss = self.portfolio.calculate_stop_loss(price, signal.side, atr);
        let take_profit = self.portfolio.calculate_take_profit(price, signal.side);

        let order = self.client.place_order(&request).await?;
        info!(
            order_id = %order.id,
            %exchange,
            symbol = %signal.symbol,
            side = %signal.side,
            amount = %size,
            %price,
            stop_loss = %stop_loss.round_dp(8),
            take_profit = %take_profit.round_dp(8),
            strategy = %signal.strategy,
            "Opened position"
        );
        self.track(order.clone());
        Ok(Some(order))
    }

    fn track(&self, order: Order) {
        self.in_flight.lock().insert(order.id.clone(), order);
    }

    /// Polls every in-flight order. Terminal orders leave the set; fills reach
    /// the portfolio through the next trade sync. Returns how many completed.
    pub async fn refresh_orders(&self) -> usize {
        let snapshot: Vec<Order> = self.in_flight.lock().values().cloned().collect();
        let mut completed = 0;
        for order in snapshot {
            match self
                .client
                .fetch_order(&order.id, &order.symbol, order.exchange)
                .await
            {
                Ok(updated) if updated.status.is_terminal() => {
                    info!(order_id = %updated.id, status = ?updated.status, "Order finished");
                    self.in_flight.lock().remove(&updated.id);
                    completed += 1;
                }
                Ok(updated) => {
                    self.in_flight.lock().insert(updated.id.clone(), updated);
                }
                Err(e) => error!(order_id = %order.id, "Failed to refresh order: {}", e),
            }
        }
        completed
    }

    async fn refresh_balances(&self, exchange: Exchange) -> Result<(), ExchangeError> {
        for balance in self.client.fetch_balance(exchange).await? {
            self.portfolio.update_balance(balance);
        }
        Ok(())
    }

    /// Balances, trade history and marks for every managed exchange. A failing
    /// exchange does not stop the others; the first failure is returned. A
    /// missing ticker only leaves that position's mark stale.
    pub async fn sync_portfolio(&self) -> Result<(), EngineError> {
        let mut first_error = None;
        for exchange in self.managed_exchanges() {
            if let Err(e) = self.sync_exchange(exchange).await {
                error!(%exchange, "Portfolio sync failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let summary = self.portfolio.get_portfolio_summary();
        info!(
            total_value = %summary.total_value,
            total_pnl = %summary.total_pnl,
            positions = summary.positions.len(),
            "Portfolio synced"
        );
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn sync_exchange(&self, exchange: Exchange) -> Result<(), ExchangeError> {
        self.refresh_balances(exchange).await?;

        let mut trades = self
            .client
            .fetch_trades(exchange, None, self.settings.trade_history_limit)
            .await?;
        trades.sort_by_key(|t| t.timestamp);
        for trade in &trades {
            self.portfolio.apply_trade(trade);
        }

        let held: Vec<Position> = self
            .portfolio
            .positions()
            .into_iter()
            .filter(|p| p.exchange == exchange)
            .collect();
        for position in held {
            match self.client.fetch_ticker(&position.symbol, exchange).await {
                Ok(ticker) => self
                    .portfolio
                    .record_mark_price(exchange, &position.symbol, ticker.last),
                Err(e) => warn!(
                    %exchange,
                    symbol = %position.symbol,
                    "Mark refresh failed, keeping last price: {}",
                    e
                ),
            }
        }
        Ok(())
    }

    /// Best-effort cancellation of every in-flight order. Each failure is
    /// logged on its own; the set is cleared afterwards.
    pub async fn cancel_all_orders(&self) {
        let orders: Vec<Order> = self.in_flight.lock().values().cloned().collect();
        if orders.is_empty() {
            return;
        }

        let results = join_all(orders.iter().map(|order| {
            self.client
                .cancel_order(&order.id, &order.symbol, order.exchange)
        }))
        .await;

        for (order, result) in orders.iter().zip(results) {
            match result {
                Ok(_) => info!(order_id = %order.id, symbol = %order.symbol, "Order cancelled"),
                Err(e) => error!(order_id = %order.id, symbol = %order.symbol, "Failed to cancel order: {}", e),
            }
        }
        self.in_flight.lock().clear();
    }

    /// First exchange, in registration order, that lists the symbol.
    fn resolve_exchange(&self, symbol: &str) -> Option<Exchange> {
        self.active_symbols
            .read()
            .iter()
            .find(|(_, symbols)| symbols.iter().any(|s| s == symbol))
            .map(|(exchange, _)| *exchange)
    }

    fn managed_exchanges(&self) -> Vec<Exchange> {
        self.active_symbols.read().iter().map(|(e, _)| *e).collect()
    }

    /// Exchange errors are recorded by the client wrapper; everything else is
    /// recorded here.
    fn report_error(&self, err: &EngineError, context: &str) {
        error!(context, "{}", err);
        if !matches!(err, EngineError::Exchange(_)) {
            self.errors.record(err.category(), err.to_string(), context, false);
        }
    }

    pub fn in_flight_order_ids(&self) -> Vec<String> {
        self.in_flight.lock().keys().cloned().collect()
    }

    pub fn get_status(&self) -> EngineStatus {
        let state = self.state();
        EngineStatus {
            state,
            running: state == EngineState::Running,
            strategies: self.strategies.read().iter().map(|s| s.name.clone()).collect(),
            active_symbols: self.active_symbols.read().clone(),
            in_flight_order_count: self.in_flight.lock().len(),
            poll_interval_ms: self.settings.poll_interval_ms,
        }
    }

    pub fn get_portfolio_summary(&self) -> PortfolioSummary {
        self.portfolio.get_portfolio_summary()
    }

    pub fn get_position(&self, exchange: Exchange, symbol: &str) -> Option<Position> {
        self.portfolio.get_position(exchange, symbol)
    }
}

/// Exchange → symbols in first-registration order, without duplicates.
fn active_symbols_of(strategies: &[RegisteredStrategy]) -> Vec<(Exchange, Vec<String>)> {
    let mut active: Vec<(Exchange, Vec<String>)> = Vec::new();
    for strategy in strategies {
        for exchange in &strategy.exchanges {
            let index = match active.iter().position(|(e, _)| e == exchange) {
                Some(index) => index,
                None => {
                    active.push((*exchange, Vec::new()));
                    active.len() - 1
                }
            };
            let symbols = &mut active[index].1;
            for symbol in &strategy.symbols {
                if !symbols.contains(symbol) {
                    symbols.push(symbol.clone());
                }
            }
        }
    }
    active
}

/// Stable ranking by priority, highest first, capped at `slots`.
fn prioritize(
    signals: Vec<TradingSignal>,
    busy: &HashSet<&str>,
    slots: usize,
) -> Vec<TradingSignal> {
    let mut eligible: Vec<TradingSignal> = signals
        .into_iter()
        .filter(|s| !busy.contains(s.symbol.as_str()))
        .collect();
    eligible.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
    eligible.truncate(slots);
    eligible
}
