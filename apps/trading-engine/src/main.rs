//! Trading Engine Binary
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trading-engine
//! ```
//!
//! # Environment Variables
//!
//! - `ALPACA_API_KEY` / `ALPACA_SECRET_KEY`: broker credentials (required)
//! - `ALPACA_PAPER`: paper endpoint (default: true)
//! - `ALLOW_LIVE_TRADING`: must be true when `ALPACA_PAPER=false`
//! - `SYMBOLS` / `CRYPTO_SYMBOLS`: trading universe
//! - `DATABASE_PATH`: SQLite path (default: data/trading.db)
//! - `DRY_RUN`, `KILL_SWITCH`, `CIRCUIT_BREAKER_RESET`: operational gates
//! - `RUST_LOG` / `LOG_LEVEL`: log filtering (default: info)
//!
//! The process exits non-zero on configuration, schema, or reconciliation
//! failure.

use trading_engine::{Config, Orchestrator};

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present; a missing file is fine.
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            // Tracing is not up yet; this must still reach the operator.
            eprintln!("Configuration error: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    tracing::info!(
        mode = if config.alpaca_paper { "paper" } else { "live" },
        dry_run = config.dry_run,
        symbols = config.symbols.len(),
        "Trading engine starting"
    );

    if config.is_live_trading_enabled() {
        tracing::warn!("LIVE TRADING ENABLED - real money at risk");
    }

    let orchestrator = Orchestrator::new(config);
    if let Err(err) = orchestrator.run().await {
        tracing::error!(error = %err, "Engine stopped with error");
        std::process::exit(1);
    }

    tracing::info!("Engine stopped");
    Ok(())
}
