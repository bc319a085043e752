// src/core/portfolio.rs
use crate::config::RiskSettings;
use crate::core::risk;
use crate::types::{
    Balance, BalanceKey, Exchange, OrderRequest, PortfolioSummary, Position, PositionKey, Side,
    Trade,
};
use crate::utils::symbol::quote_asset;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// What folding one trade did to the position it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillOutcome {
    Opened,
    Increased,
    Reduced,
    Closed,
    Flipped,
    /// The trade id was already applied; nothing changed.
    Duplicate,
    /// Zero or negative amount; logged and skipped.
    Ignored,
}

#[derive(Debug, Default)]
struct Book {
    positions: BTreeMap<PositionKey, Position>,
    balances: BTreeMap<BalanceKey, Balance>,
    trades: Vec<Trade>,
    applied: HashSet<(Exchange, String)>,
    marks: BTreeMap<PositionKey, Decimal>,
}

/// Owns position and balance state. All access goes through the accessors
/// below; one lock guards the whole book.
#[derive(Debug)]
pub struct PortfolioManager {
    risk: RiskSettings,
    book: RwLock<Book>,
}

impl PortfolioManager {
    pub fn new(risk: RiskSettings) -> Self {
        Self {
            risk,
            book: RwLock::new(Book::default()),
        }
    }

    /// Last write wins.
    pub fn update_balance(&self, balance: Balance) {
        self.book.write().balances.insert(balance.key(), balance);
    }

    /// A zero (or negative) size removes the position instead of storing it.
    pub fn update_position(&self, position: Position) {
        let key = position.key();
        let mut book = self.book.write();
        if position.size <= Decimal::ZERO {
            if book.positions.remove(&key).is_some() {
                debug!(exchange = %key.exchange, symbol = %key.symbol, "Position removed");
            }
            return;
        }
        book.positions.insert(key, position);
    }

    pub fn get_position(&self, exchange: Exchange, symbol: &str) -> Option<Position> {
        self.book
            .read()
            .positions
            .get(&PositionKey::new(exchange, symbol))
            .cloned()
    }

    pub fn get_balance(&self, exchange: Exchange, asset: &str) -> Option<Balance> {
        self.book
            .read()
            .balances
            .get(&BalanceKey::new(exchange, asset))
            .cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.book.read().positions.values().cloned().collect()
    }

    pub fn balances(&self) -> Vec<Balance> {
        self.book.read().balances.values().cloned().collect()
    }

    /// Applied trades, in the order they were folded.
    pub fn trades(&self) -> Vec<Trade> {
        self.book.read().trades.clone()
    }

    /// Folds one fill into the position for its (exchange, symbol).
    ///
    /// Same-side fills average the entry by notional. Opposite-side fills
    /// reduce the position, close it at exactly zero, or flip it: the excess
    /// becomes the new size and the fill price the new entry. Each trade id is
    /// applied at most once per exchange.
    pub fn apply_trade(&self, trade: &Trade) -> FillOutcome {
        let mut guard = self.book.write();
        let book = &mut *guard;
        let trade_key = (trade.exchange, trade.id.clone());
        if book.applied.contains(&trade_key) {
            return FillOutcome::Duplicate;
        }
        book.applied.insert(trade_key);
        book.trades.push(trade.clone());

        if trade.amount <= Decimal::ZERO {
            warn!(trade_id = %trade.id, amount = %trade.amount, "Skipping trade with non-positive amount");
            return FillOutcome::Ignored;
        }

        let key = PositionKey::new(trade.exchange, trade.symbol.clone());
        let now = Utc::now();
        let mark = book.marks.get(&key).copied().unwrap_or(trade.price);

        let outcome = match book.positions.get_mut(&key) {
            None => {
                book.positions.insert(
                    key.clone(),
                    Position {
                        symbol: trade.symbol.clone(),
                        exchange: trade.exchange,
                        side: trade.side,
                        size: trade.amount,
                        entry_price: trade.price,
                        market_price: mark,
                        updated_at: now,
                    },
                );
                FillOutcome::Opened
            }
            Some(position) if position.side == trade.side => {
                let size = position.size + trade.amount;
                let notional = position.size * position.entry_price + trade.amount * trade.price;
                position.entry_price = notional / size;
                position.size = size;
                position.market_price = mark;
                position.updated_at = now;
                FillOutcome::Increased
            }
            Some(position) if trade.amount < position.size => {
                position.size -= trade.amount;
                position.market_price = mark;
                position.updated_at = now;
                FillOutcome::Reduced
            }
            Some(position) if trade.amount == position.size => FillOutcome::Closed,
            Some(position) => {
                position.size = trade.amount - position.size;
                position.side = trade.side;
                position.entry_price = trade.price;
                position.market_price = mark;
                position.updated_at = now;
                FillOutcome::Flipped
            }
        };
        if outcome == FillOutcome::Closed {
            book.positions.remove(&key);
        }

        info!(
            exchange = %trade.exchange,
            symbol = %trade.symbol,
            side = %trade.side,
            amount = %trade.amount,
            price = %trade.price,
            outcome = ?outcome,
            "Trade applied"
        );
        outcome
    }

    /// Latest observed price; also refreshes the open position's mark.
    pub fn record_mark_price(&self, exchange: Exchange, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        let key = PositionKey::new(exchange, symbol);
        let mut book = self.book.write();
        if let Some(position) = book.positions.get_mut(&key) {
            position.market_price = price;
            position.updated_at = Utc::now();
        }
        book.marks.insert(key, price);
    }

    pub fn mark_price(&self, exchange: Exchange, symbol: &str) -> Option<Decimal> {
        self.book
            .read()
            .marks
            .get(&PositionKey::new(exchange, symbol))
            .copied()
    }

    /// Quote currency used for sizing and risk checks on `symbol`.
    pub fn quote_asset_for(&self, symbol: &str) -> String {
        quote_asset(symbol).unwrap_or_else(|| self.risk.default_quote_asset.clone())
    }

    fn free_quote(&self, exchange: Exchange, symbol: &str) -> Option<Decimal> {
        let asset = self.quote_asset_for(symbol);
        self.get_balance(exchange, &asset).map(|b| b.free)
    }

    pub fn calculate_position_size(
        &self,
        symbol: &str,
        exchange: Exchange,
        current_price: Decimal,
        signal_strength: f64,
    ) -> Decimal {
        self.calculate_position_size_with_risk(
            symbol,
            exchange,
            current_price,
            signal_strength,
            self.risk.risk_percentage,
        )
    }

    /// Zero when there is no quote balance on record.
    pub fn calculate_position_size_with_risk(
        &self,
        symbol: &str,
        exchange: Exchange,
        current_price: Decimal,
        signal_strength: f64,
        risk_percentage: Decimal,
    ) -> Decimal {
        let Some(free) = self.free_quote(exchange, symbol) else {
            debug!(%exchange, symbol, "No quote balance; position size is zero");
            return Decimal::ZERO;
        };
        let strength = Decimal::from_f64(signal_strength.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO);
        risk::position_size(free, risk_percentage, strength, current_price)
    }

    pub fn calculate_stop_loss(&self, entry_price: Decimal, side: Side, atr: Option<Decimal>) -> Decimal {
        risk::stop_loss(
            entry_price,
            side,
            atr,
            self.risk.stop_multiplier,
            self.risk.default_stop_pct,
        )
    }

    pub fn calculate_take_profit(&self, entry_price: Decimal, side: Side) -> Decimal {
        risk::take_profit(
            entry_price,
            side,
            self.risk.risk_reward_ratio,
            self.risk.default_stop_pct,
        )
    }

    /// True iff the order's notional fits in the free quote balance. Uses the
    /// order price, else the last mark price. Fails closed when either the
    /// balance or a reference price is missing.
    pub fn check_risk_limits(&self, order: &OrderRequest) -> bool {
        let Some(free) = self.free_quote(order.exchange, &order.symbol) else {
            warn!(exchange = %order.exchange, symbol = %order.symbol, "Risk check failed: no quote balance");
            return false;
        };
        let Some(price) = order
            .price
            .or_else(|| self.mark_price(order.exchange, &order.symbol))
        else {
            warn!(exchange = %order.exchange, symbol = %order.symbol, "Risk check failed: no reference price");
            return false;
        };

        let notional = order.amount * price;
        if notional > free {
            warn!(
                exchange = %order.exchange,
                symbol = %order.symbol,
                %notional,
                %free,
                "Risk check failed: notional exceeds free balance"
            );
            return false;
        }
        true
    }

    pub fn get_portfolio_summary(&self) -> PortfolioSummary {
        let book = self.book.read();
        let positions: Vec<Position> = book.positions.values().cloned().collect();
        let cash: Decimal = book.balances.values().map(|b| b.total).sum();
        let available_balance: Decimal = book.balances.values().map(|b| b.free).sum();
        let exposure: Decimal = positions.iter().map(Position::notional).sum();
        let total_pnl: Decimal = positions.iter().map(Position::unrealized_pnl).sum();

        PortfolioSummary {
            total_value: cash + exposure,
            total_pnl,
            available_balance,
            positions,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> PortfolioManager {
        PortfolioManager::new(RiskSettings::default())
    }

    fn trade(id: &str, side: Side, amount: Decimal, price: Decimal) -> Trade {
        Trade {
            id: id.to_string(),
            order_id: format!("order-{id}"),
            symbol: "BTC/USDT".to_string(),
            exchange: Exchange::Binance,
            side,
            amount,
            price,
            fee: Decimal::ZERO,
            fee_currency: "USDT".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn position(side: Side, size: Decimal, entry: Decimal) -> Position {
        Position {
            symbol: "BTC/USDT".to_string(),
            exchange: Exchange::Binance,
            side,
            size,
            entry_price: entry,
            market_price: entry,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn same_side_fills_average_entry() {
        let pm = manager();
        assert_eq!(
            pm.apply_trade(&trade("t1", Side::Buy, dec!(0.1), dec!(50000))),
            FillOutcome::Opened
        );
        assert_eq!(
            pm.apply_trade(&trade("t2", Side::Buy, dec!(0.1), dec!(52000))),
            FillOutcome::Increased
        );

        let pos = pm.get_position(Exchange::Binance, "BTC/USDT").unwrap();
        assert_eq!(pos.side, Side::Buy);
        assert_eq!(pos.size, dec!(0.2));
        assert_eq!(pos.entry_price, dec!(51000));
    }

    #[test]
    fn dash_symbols_size_against_the_quote_balance() {
        let pm = manager();
        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(10000), Decimal::ZERO));
        pm.update_balance(Balance::new(Exchange::Binance, "ETH", dec!(3), Decimal::ZERO));

        assert_eq!(pm.quote_asset_for("ETH-USDT"), "USDT");
        assert_eq!(
            pm.calculate_position_size("ETH-USDT", Exchange::Binance, dec!(2500), 1.0),
            dec!(0.08)
        );
        pm.record_mark_price(Exchange::Binance, "ETH-USDT", dec!(2500));
        assert!(pm.check_risk_limits(&OrderRequest::market(
            "ETH-USDT",
            Exchange::Binance,
            Side::Buy,
            dec!(2)
        )));
    }

    #[test]
    fn smaller_opposite_fill_keeps_entry() {
        let pm = manager();
        pm.apply_trade(&trade("t1", Side::Buy, dec!(0.2), dec!(50000)));
        assert_eq!(
            pm.apply_trade(&trade("t2", Side::Sell, dec!(0.05), dec!(53000))),
            FillOutcome::Reduced
        );

        let pos = pm.get_position(Exchange::Binance, "BTC/USDT").unwrap();
        assert_eq!(pos.size, dec!(0.15));
        assert_eq!(pos.entry_price, dec!(50000));
    }

    #[test]
    fn equal_opposite_fill_removes_position() {
        let pm = manager();
        pm.apply_trade(&trade("t1", Side::Buy, dec!(0.2), dec!(50000)));
        assert_eq!(
            pm.apply_trade(&trade("t2", Side::Sell, dec!(0.2), dec!(51000))),
            FillOutcome::Closed
        );
        assert!(pm.get_position(Exchange::Binance, "BTC/USDT").is_none());
        assert!(pm.positions().is_empty());
    }

    #[test]
    fn larger_opposite_fill_flips_at_fill_price() {
        let pm = manager();
        pm.apply_trade(&trade("t1", Side::Buy, dec!(0.2), dec!(50000)));
        assert_eq!(
            pm.apply_trade(&trade("t2", Side::Sell, dec!(0.3), dec!(49000))),
            FillOutcome::Flipped
        );

        let pos = pm.get_position(Exchange::Binance, "BTC/USDT").unwrap();
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.size, dec!(0.1));
        assert_eq!(pos.entry_price, dec!(49000));
    }

    #[test]
    fn replayed_trades_are_applied_once() {
        let pm = manager();
        let fill = trade("t1", Side::Buy, dec!(0.1), dec!(50000));
        assert_eq!(pm.apply_trade(&fill), FillOutcome::Opened);
        assert_eq!(pm.apply_trade(&fill), FillOutcome::Duplicate);

        assert_eq!(pm.trades().len(), 1);
        assert_eq!(
            pm.get_position(Exchange::Binance, "BTC/USDT").unwrap().size,
            dec!(0.1)
        );
    }

    #[test]
    fn zero_size_update_removes_instead_of_storing() {
        let pm = manager();
        pm.update_position(position(Side::Buy, dec!(1), dec!(100)));
        assert!(pm.get_position(Exchange::Binance, "BTC/USDT").is_some());

        pm.update_position(position(Side::Buy, Decimal::ZERO, dec!(100)));
        assert!(pm.get_position(Exchange::Binance, "BTC/USDT").is_none());

        pm.update_position(position(Side::Buy, Decimal::ZERO, dec!(100)));
        assert!(pm.positions().is_empty());
    }

    #[test]
    fn balances_are_keyed_by_exchange_and_asset() {
        let pm = manager();
        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(100), dec!(5)));
        pm.update_balance(Balance::new(Exchange::Upbit, "USDT", dec!(7), Decimal::ZERO));
        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(200), dec!(5)));

        let binance = pm.get_balance(Exchange::Binance, "USDT").unwrap();
        assert_eq!(binance.free, dec!(200));
        assert_eq!(binance.total, dec!(205));
        assert_eq!(pm.get_balance(Exchange::Upbit, "USDT").unwrap().free, dec!(7));
        assert!(pm.get_balance(Exchange::Upbit, "KRW").is_none());
    }

    #[test]
    fn sizing_uses_free_quote_balance() {
        let pm = manager();
        assert_eq!(
            pm.calculate_position_size("BTC/USDT", Exchange::Binance, dec!(50000), 1.0),
            Decimal::ZERO
        );

        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(10000), Decimal::ZERO));
        assert_eq!(
            pm.calculate_position_size("BTC/USDT", Exchange::Binance, dec!(50000), 1.0),
            dec!(0.004)
        );
        assert_eq!(
            pm.calculate_position_size_with_risk(
                "BTC/USDT",
                Exchange::Binance,
                dec!(50000),
                0.5,
                dec!(0.1)
            ),
            dec!(0.01)
        );
        // Balance on another venue does not count.
        assert_eq!(
            pm.calculate_position_size("BTC/USDT", Exchange::Upbit, dec!(50000), 1.0),
            Decimal::ZERO
        );
    }

    #[test]
    fn stops_and_targets_follow_risk_settings() {
        let pm = manager();
        assert_eq!(pm.calculate_stop_loss(dec!(50000), Side::Buy, None), dec!(49000));
        assert_eq!(pm.calculate_stop_loss(dec!(50000), Side::Sell, None), dec!(51000));
        assert_eq!(pm.calculate_take_profit(dec!(50000), Side::Buy), dec!(52000));
        assert_eq!(pm.calculate_take_profit(dec!(50000), Side::Sell), dec!(48000));
    }

    #[test]
    fn risk_limits_compare_notional_with_free_balance() {
        let pm = manager();
        let at_limit = OrderRequest::limit("BTC/USDT", Exchange::Binance, Side::Buy, dec!(0.2), dec!(50000));
        assert!(!pm.check_risk_limits(&at_limit), "no balance record fails closed");

        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(10000), Decimal::ZERO));
        assert!(pm.check_risk_limits(&at_limit));

        let over = OrderRequest::limit("BTC/USDT", Exchange::Binance, Side::Buy, dec!(0.21), dec!(50000));
        assert!(!pm.check_risk_limits(&over));
    }

    #[test]
    fn market_orders_are_checked_against_mark_price() {
        let pm = manager();
        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(1000), Decimal::ZERO));
        let order = OrderRequest::market("BTC/USDT", Exchange::Binance, Side::Buy, dec!(0.01));
        assert!(!pm.check_risk_limits(&order), "no reference price fails closed");

        pm.record_mark_price(Exchange::Binance, "BTC/USDT", dec!(50000));
        assert!(pm.check_risk_limits(&order));

        pm.record_mark_price(Exchange::Binance, "BTC/USDT", dec!(200000));
        assert!(!pm.check_risk_limits(&order));
    }

    #[test]
    fn summary_is_derived_from_current_state() {
        let pm = manager();
        pm.update_balance(Balance::new(Exchange::Binance, "USDT", dec!(1000), dec!(100)));
        pm.update_balance(Balance::new(Exchange::Upbit, "KRW", dec!(500), Decimal::ZERO));
        pm.apply_trade(&trade("t1", Side::Buy, dec!(0.1), dec!(50000)));
        pm.record_mark_price(Exchange::Binance, "BTC/USDT", dec!(51000));

        let summary = pm.get_portfolio_summary();
        assert_eq!(summary.available_balance, dec!(1500));
        assert_eq!(summary.total_value, dec!(1600) + dec!(5100));
        assert_eq!(summary.total_pnl, dec!(100));
        assert_eq!(summary.positions.len(), 1);

        pm.apply_trade(&trade("t2", Side::Sell, dec!(0.1), dec!(51000)));
        let summary = pm.get_portfolio_summary();
        assert_eq!(summary.total_value, dec!(1600));
        assert!(summary.positions.is_empty());
    }
}
