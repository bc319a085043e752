// tests/engine_flow.rs
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use the_conductor::config::{EngineSettings, RiskSettings};
use the_conductor::connectors::paper::{FillMode, PaperExchange};
use the_conductor::connectors::traits::ExchangeClient;
use the_conductor::core::engine::{EngineState, TradingEngine};
use the_conductor::core::portfolio::PortfolioManager;
use the_conductor::errors::ExchangeError;
use the_conductor::strategies::traits::SignalSource;
use the_conductor::types::{
    Candle, Exchange, OrderRequest, OrderStatus, OrderType, Position, Side, TradingSignal,
};
use the_conductor::utils::error_collector::ErrorCollector;

/// Emits the same signal for every listed symbol it sees.
struct FixedSignal {
    side: Side,
    strength: f64,
    confidence: f64,
}

impl SignalSource for FixedSignal {
    fn strategy_name(&self) -> &str {
        "fixed"
    }

    fn signal(&self, symbol: &str, bars: &[Candle]) -> Option<TradingSignal> {
        if bars.is_empty() {
            return None;
        }
        Some(TradingSignal::new(
            symbol,
            self.side,
            self.strength,
            self.confidence,
            "fixed",
            json!({}),
        ))
    }
}

fn candles(price: Decimal, count: usize) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| Candle {
            timestamp: start + Duration::hours(i as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(10),
        })
        .collect()
}

struct Harness {
    paper: Arc<PaperExchange>,
    engine: Arc<TradingEngine>,
}

fn harness(settings: EngineSettings) -> Harness {
    let paper = Arc::new(PaperExchange::new(vec![Exchange::Binance]));
    paper.set_balance(Exchange::Binance, "USDT", dec!(10000));
    paper.set_candles(Exchange::Binance, "BTC/USDT", candles(dec!(50000), 5));
    paper.set_candles(Exchange::Binance, "ETH/USDT", candles(dec!(2500), 5));

    let client: Arc<dyn ExchangeClient> = paper.clone();
    let engine = Arc::new(TradingEngine::new(
        client,
        Arc::new(PortfolioManager::new(RiskSettings::default())),
        Arc::new(ErrorCollector::default()),
        settings,
    ));
    Harness { paper, engine }
}

fn buy_signal(symbol: &str, strength: f64, confidence: f64) -> TradingSignal {
    TradingSignal::new(symbol, Side::Buy, strength, confidence, "fixed", json!({}))
}

fn sell_signal(symbol: &str, strength: f64, confidence: f64) -> TradingSignal {
    TradingSignal::new(symbol, Side::Sell, strength, confidence, "fixed", json!({}))
}

fn register(engine: &TradingEngine, source: FixedSignal, symbols: &[&str]) {
    engine.add_strategy(
        "fixed",
        Arc::new(source),
        symbols.iter().map(|s| s.to_string()).collect(),
        vec![Exchange::Binance],
    );
}

#[tokio::test]
async fn buy_signal_places_one_sized_market_order() {
    let h = harness(EngineSettings::default());
    let idle = FixedSignal {
        side: Side::Buy,
        strength: 0.0,
        confidence: 0.0,
    };
    register(&h.engine, idle, &["BTC/USDT"]);
    h.engine.sync_portfolio().await.unwrap();

    let expected = h
        .engine
        .portfolio()
        .calculate_position_size("BTC/USDT", Exchange::Binance, dec!(50000), 0.8);
    assert_eq!(expected, dec!(0.0032));

    let placed = h
        .engine
        .process_signals(vec![buy_signal("BTC/USDT", 0.8, 0.75)])
        .await;

    assert_eq!(placed.len(), 1);
    let requests = h.paper.placed_orders();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].side, Side::Buy);
    assert_eq!(requests[0].order_type, OrderType::Market);
    assert_eq!(requests[0].amount, expected);
    assert_eq!(h.engine.in_flight_order_ids(), vec![placed[0].id.clone()]);
    assert_eq!(h.engine.get_status().in_flight_order_count, 1);
}

#[tokio::test]
async fn weak_opposing_signal_leaves_long_alone() {
    let h = harness(EngineSettings::default());
    let idle = FixedSignal {
        side: Side::Sell,
        strength: 0.0,
        confidence: 0.0,
    };
    register(&h.engine, idle, &["BTC/USDT"]);
    h.engine.sync_portfolio().await.unwrap();

    let long = Position {
        symbol: "BTC/USDT".to_string(),
        exchange: Exchange::Binance,
        side: Side::Buy,
        size: dec!(0.1),
        entry_price: dec!(48000),
        market_price: dec!(50000),
        updated_at: Utc::now(),
    };
    h.engine.portfolio().update_position(long.clone());

    let placed = h
        .engine
        .process_signals(vec![sell_signal("BTC/USDT", 0.9, 0.65)])
        .await;
    assert!(placed.is_empty());
    assert!(h.paper.placed_orders().is_empty());
    assert!(h.engine.in_flight_order_ids().is_empty());
    assert_eq!(
        h.engine.get_position(Exchange::Binance, "BTC/USDT").unwrap().size,
        dec!(0.1)
    );

    // A confident reversal closes the whole position with one market order.
    let placed = h
        .engine
        .process_signals(vec![sell_signal("BTC/USDT", 0.9, 0.75)])
        .await;
    assert_eq!(placed.len(), 1);
    let requests = h.paper.placed_orders();
    assert_eq!(requests[0].side, Side::Sell);
    assert_eq!(requests[0].amount, dec!(0.1));
}

#[tokio::test]
async fn stop_cancels_every_order_even_when_one_fails() {
    let h = harness(EngineSettings::default());
    h.paper.set_fill_mode(FillMode::Resting);
    let idle = FixedSignal {
        side: Side::Buy,
        strength: 0.0,
        confidence: 0.0,
    };
    register(&h.engine, idle, &["BTC/USDT", "ETH/USDT"]);
    h.engine.sync_portfolio().await.unwrap();

    let placed = h
        .engine
        .process_signals(vec![
            buy_signal("BTC/USDT", 0.9, 0.9),
            buy_signal("ETH/USDT", 0.5, 0.5),
        ])
        .await;
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[0].symbol, "BTC/USDT");
    h.paper.fail_cancel(&placed[0].id);

    h.engine.stop().await;

    assert!(h.engine.in_flight_order_ids().is_empty());
    assert_eq!(h.paper.order(&placed[0].id).unwrap().status, OrderStatus::Open);
    assert_eq!(
        h.paper.order(&placed[1].id).unwrap().status,
        OrderStatus::Canceled
    );
    assert_eq!(h.engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn failed_pair_is_skipped_and_others_still_trade() {
    let h = harness(EngineSettings::default());
    let buyer = FixedSignal {
        side: Side::Buy,
        strength: 0.8,
        confidence: 0.8,
    };
    register(&h.engine, buyer, &["BTC/USDT", "ETH/USDT"]);
    h.engine.sync_portfolio().await.unwrap();
    h.paper.fail_next_ohlcv(
        Exchange::Binance,
        "BTC/USDT",
        ExchangeError::Network {
            exchange: Exchange::Binance,
            message: "timeout".into(),
        },
    );

    let report = h.engine.run_iteration().await.unwrap();
    assert_eq!(report.pairs_scanned, 2);
    assert_eq!(report.pairs_skipped, 1);
    assert_eq!(report.signals, 1);
    assert_eq!(report.orders_placed, 1);
    assert_eq!(h.paper.placed_orders()[0].symbol, "ETH/USDT");
}

#[tokio::test]
async fn fills_reconcile_once_across_iterations() {
    let h = harness(EngineSettings::default());
    let buyer = FixedSignal {
        side: Side::Buy,
        strength: 1.0,
        confidence: 0.9,
    };
    register(&h.engine, buyer, &["BTC/USDT"]);
    h.engine.sync_portfolio().await.unwrap();

    let first = h.engine.run_iteration().await.unwrap();
    assert_eq!(first.orders_placed, 1);
    assert_eq!(first.orders_completed, 1);
    assert!(h.engine.in_flight_order_ids().is_empty());

    let position = h.engine.get_position(Exchange::Binance, "BTC/USDT").unwrap();
    assert_eq!(position.side, Side::Buy);
    assert_eq!(position.size, dec!(0.004));
    assert_eq!(position.entry_price, dec!(50000));

    // Same-side signal with a position open: nothing new, nothing double counted.
    let second = h.engine.run_iteration().await.unwrap();
    assert_eq!(second.orders_placed, 0);
    assert_eq!(h.paper.placed_orders().len(), 1);
    assert_eq!(
        h.engine.get_position(Exchange::Binance, "BTC/USDT").unwrap().size,
        dec!(0.004)
    );
    assert_eq!(h.engine.portfolio().trades().len(), 1);
    assert_eq!(
        h.engine
            .portfolio()
            .get_balance(Exchange::Binance, "USDT")
            .unwrap()
            .free,
        dec!(9799.8)
    );
}

#[tokio::test]
async fn loop_keeps_polling_through_market_data_failures() {
    let settings = EngineSettings {
        poll_interval_ms: 5,
        ..EngineSettings::default()
    };
    let h = harness(settings);
    let idle = FixedSignal {
        side: Side::Buy,
        strength: 0.0,
        confidence: 0.0,
    };
    register(&h.engine, idle, &["BTC/USDT"]);
    for _ in 0..3 {
        h.paper.fail_next_ohlcv(
            Exchange::Binance,
            "BTC/USDT",
            ExchangeError::Network {
                exchange: Exchange::Binance,
                message: "connection reset".into(),
            },
        );
    }

    let runner = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.start().await })
    };
    while h.paper.ohlcv_calls() < 5 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(h.engine.state(), EngineState::Running);

    h.engine.stop().await;
    runner.await.unwrap().unwrap();
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert!(!h.engine.get_status().running);
}

#[tokio::test]
async fn failing_venue_does_not_block_reconciliation_of_others() {
    let h = harness(EngineSettings::default());
    h.engine.add_strategy(
        "fixed",
        Arc::new(FixedSignal {
            side: Side::Buy,
            strength: 0.0,
            confidence: 0.0,
        }),
        vec!["BTC/USDT".to_string()],
        vec![Exchange::Upbit, Exchange::Binance],
    );
    let fill = h
        .paper
        .place_order(&OrderRequest::market(
            "BTC/USDT",
            Exchange::Binance,
            Side::Buy,
            dec!(0.01),
        ))
        .await
        .unwrap();
    assert_eq!(fill.status, OrderStatus::Closed);

    // The paper venue only serves Binance, so the Upbit leg fails first.
    assert!(h.engine.sync_portfolio().await.is_err());

    let position = h.engine.get_position(Exchange::Binance, "BTC/USDT").unwrap();
    assert_eq!(position.size, dec!(0.01));
    assert_eq!(h.engine.portfolio().trades().len(), 1);
    assert_eq!(
        h.engine
            .portfolio()
            .get_balance(Exchange::Binance, "USDT")
            .unwrap()
            .free,
        dec!(9499.5)
    );
}

#[tokio::test]
async fn rejected_order_leaves_portfolio_untouched() {
    let h = harness(EngineSettings::default());
    let idle = FixedSignal {
        side: Side::Buy,
        strength: 0.0,
        confidence: 0.0,
    };
    register(&h.engine, idle, &["BTC/USDT"]);
    h.engine.sync_portfolio().await.unwrap();
    let before = h.engine.get_portfolio_summary();

    // The venue's balance drops behind the portfolio's back, so it refuses the buy.
    h.paper.set_balance(Exchange::Binance, "USDT", dec!(10));
    let placed = h
        .engine
        .process_signals(vec![buy_signal("BTC/USDT", 0.8, 0.9)])
        .await;

    assert!(placed.is_empty());
    assert_eq!(h.paper.placed_orders().len(), 1);
    assert!(h.engine.in_flight_order_ids().is_empty());
    assert!(h.engine.get_position(Exchange::Binance, "BTC/USDT").is_none());
    assert!(h.engine.portfolio().trades().is_empty());
    assert_eq!(
        h.engine
            .portfolio()
            .get_balance(Exchange::Binance, "USDT")
            .unwrap()
            .free,
        dec!(10000)
    );
    assert_eq!(h.engine.get_portfolio_summary().total_value, before.total_value);
}

#[tokio::test]
async fn missing_ticker_does_not_freeze_other_marks() {
    let h = harness(EngineSettings::default());
    let idle = FixedSignal {
        side: Side::Buy,
        strength: 0.0,
        confidence: 0.0,
    };
    register(&h.engine, idle, &["BTC/USDT"]);
    for (symbol, entry) in [("AAA/USDT", dec!(1)), ("BTC/USDT", dec!(50000))] {
        h.engine.portfolio().update_position(Position {
            symbol: symbol.to_string(),
            exchange: Exchange::Binance,
            side: Side::Buy,
            size: dec!(0.1),
            entry_price: entry,
            market_price: entry,
            updated_at: Utc::now(),
        });
    }
    h.paper.set_price(Exchange::Binance, "BTC/USDT", dec!(60000));

    h.engine.sync_portfolio().await.unwrap();

    let btc = h.engine.get_position(Exchange::Binance, "BTC/USDT").unwrap();
    assert_eq!(btc.market_price, dec!(60000));
    assert_eq!(btc.unrealized_pnl(), dec!(1000));
    let stale = h.engine.get_position(Exchange::Binance, "AAA/USDT").unwrap();
    assert_eq!(stale.market_price, dec!(1));
}
