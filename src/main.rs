// src/main.rs
use dotenvy::dotenv;
use std::sync::Arc;
use the_conductor::config::AppConfig;
use the_conductor::connectors::paper::PaperExchange;
use the_conductor::connectors::retry::{RetryPolicy, RetryingClient};
use the_conductor::core::engine::TradingEngine;
use the_conductor::core::portfolio::PortfolioManager;
use the_conductor::strategies::StrategyRegistry;
use the_conductor::utils::error_collector::ErrorCollector;
use the_conductor::utils::logging::init_tracing;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Load Configuration
    let config = AppConfig::new()?;
    let _log_guard = init_tracing(&config.logging)?;

    info!("========================================");
    info!("       THE CONDUCTOR - v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!(
        "Mode: PAPER TRADING | poll every {} ms | {} strategies",
        config.engine.poll_interval_ms,
        config.strategies.len()
    );

    // 2. Initialize Components
    let errors = Arc::new(ErrorCollector::new(config.errors.capacity));
    let paper = PaperExchange::from_settings(&config.paper);
    let client = Arc::new(RetryingClient::new(
        paper,
        RetryPolicy::from_settings(&config.retry),
        errors.clone(),
    ));
    let portfolio = Arc::new(PortfolioManager::new(config.risk.clone()));
    let engine = Arc::new(TradingEngine::new(
        client,
        portfolio,
        errors.clone(),
        config.engine.clone(),
    ));

    // 3. Register Strategies
    let registry = StrategyRegistry::with_builtin();
    for entry in &config.strategies {
        let source = registry.build(&entry.kind, &entry.name, &entry.params)?;
        engine.add_strategy(
            entry.name.clone(),
            source,
            entry.symbols.clone(),
            entry.exchanges.clone(),
        );
    }
    if config.strategies.is_empty() {
        warn!("No strategies configured; the engine will only track the portfolio");
    }

    // 4. Run Engine until Ctrl+C
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    engine.stop().await;

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Engine error: {}", e),
        Err(e) => error!("Engine task failed: {}", e),
    }

    let summary = engine.get_portfolio_summary();
    info!(
        total_value = %summary.total_value,
        total_pnl = %summary.total_pnl,
        positions = summary.positions.len(),
        "Final portfolio"
    );
    let report = errors.summary(10);
    info!(total = report.total, by_category = ?report.by_category, "Error summary");

    Ok(())
}
