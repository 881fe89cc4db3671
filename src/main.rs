use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

use ordergate::core::types::{MarketSnapshot, Price, Quantity, StrategyId, Symbol, UserId};
use ordergate::{Config, StrategySpec, TradingEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ordergate=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    // 2. Load configuration (optional path as first argument)
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path))?,
        None => Config::default(),
    };

    tracing::info!(mode = ?config.app.mode, "OrderGate starting");

    // 3. Build a paper engine and register an EMA crossover strategy
    let engine = TradingEngine::paper(config);
    engine.start();

    let strategy_id = StrategyId(1);
    engine.register_strategy(StrategySpec {
        strategy_id,
        user_id: UserId(1),
        symbol: Symbol::new("NSE:SBIN-EQ"),
        order_quantity: Quantity::new(10),
        rules: vec![
            r#"{
                "name": "golden cross",
                "conditions": [
                    {"left": "EMA_9", "op": "CROSS_ABOVE", "right": "EMA_21"},
                    {"left": "RSI_14", "op": "<", "right": 70}
                ],
                "operator": "AND",
                "action": "BUY"
            }"#
            .to_string(),
            r#"{
                "name": "death cross",
                "conditions": [
                    {"left": "EMA_9", "op": "CROSS_BELOW", "right": "EMA_21"}
                ],
                "action": "SELL"
            }"#
            .to_string(),
        ],
        limits: None,
    })?;

    // 4. Audit feed: every event, as it flows
    let mut audit = engine.audit();
    tokio::spawn(async move {
        while let Some(event) = audit.recv().await {
            tracing::info!(kind = %event.kind(), "event");
        }
    });

    // 5. Replay a synthetic tick sequence: trend down, cross up, cross down
    let ticks: Vec<(f64, f64, f64, f64)> = vec![
        (578.00, 98.0, 99.5, 45.0),
        (579.20, 99.0, 99.4, 50.0),
        (580.50, 100.1, 99.3, 55.0), // EMA_9 crosses above EMA_21
        (582.00, 101.0, 99.5, 60.0),
        (579.00, 99.0, 99.6, 48.0), // and back below
    ];

    for (price, ema9, ema21, rsi) in ticks {
        let snapshot: MarketSnapshot = [("EMA_9", ema9), ("EMA_21", ema21), ("RSI_14", rsi)]
            .into_iter()
            .collect();
        engine.inject_market_data(
            strategy_id,
            Symbol::new("NSE:SBIN-EQ"),
            Price::from_f64(price),
            snapshot,
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    // 6. Session summary
    for order in engine.orders() {
        tracing::info!(
            client_order_id = %order.client_order_id,
            side = %order.side,
            status = ?order.status,
            filled = %order.filled_quantity,
            "order"
        );
    }
    if let Some(risk) = engine.risk_snapshot(strategy_id) {
        tracing::info!(
            trades = risk.trades_today,
            pnl = %risk.realized_pnl_today,
            exposure = %risk.open_exposure,
            "risk summary"
        );
    }

    Ok(())
}
