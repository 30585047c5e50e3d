//! Configuration loaded from the environment, with validation.
//!
//! Live trading is double-gated: selecting the live API
//! (`ALPACA_PAPER=false`) without `ALLOW_LIVE_TRADING=true` is a
//! configuration error and the process refuses to start.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Default path of the kill-switch sentinel file, relative to the working
/// directory. Its existence halts trading; checked on every signal.
pub const KILL_SWITCH_FILE: &str = "data/.kill_switch";

/// Valid bar timeframes accepted from `BAR_TIMEFRAME`.
const VALID_TIMEFRAMES: &[&str] = &["1Min", "5Min", "15Min", "1Hour", "1Day"];

/// Valid equity data feeds accepted from `STREAM_FEED`.
const VALID_FEEDS: &[&str] = &["iex", "sip"];

/// Session-specific risk limits.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Maximum fraction of equity per position.
    pub max_position_pct: f64,
    /// Daily loss limit as a fraction of equity.
    pub max_daily_loss_pct: f64,
    /// Maximum trades per day.
    pub max_trades_per_day: u32,
    /// Maximum concurrently open positions.
    pub max_concurrent_positions: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_pct: 0.10,
            max_daily_loss_pct: 0.05,
            max_trades_per_day: 20,
            max_concurrent_positions: 10,
        }
    }
}

/// Signal filter settings (Tier 3).
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Maximum acceptable (ask - bid) / bid; `None` disables the filter.
    pub max_spread_pct: Option<f64>,
    /// Minimum trade count on the last bar; `None` disables the filter.
    pub min_bar_trades: Option<u64>,
    /// Skip signals this many minutes after the 09:30 ET open.
    pub avoid_first_minutes: i64,
    /// Skip signals this many minutes before the 16:00 ET close.
    pub avoid_last_minutes: i64,
}

/// Exit evaluation settings.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Fixed stop loss, e.g. 0.01 = -1%.
    pub stop_loss_pct: f64,
    /// Fixed profit target, e.g. 0.02 = +2%.
    pub profit_target_pct: f64,
    /// Whether trailing stops are armed.
    pub trailing_stop_enabled: bool,
    /// Unrealised gain required to activate the trailing stop.
    pub trailing_stop_activation_pct: f64,
    /// Trail distance below/above the extreme price.
    pub trailing_stop_trail_pct: f64,
    /// Seconds between exit evaluations.
    pub check_interval_seconds: u64,
    /// Close everything when the circuit breaker trips.
    pub exit_on_circuit_breaker: bool,
    /// ATR multiplier for the dynamic stop.
    pub atr_multiplier_stop: f64,
    /// ATR multiplier for the dynamic target.
    pub atr_multiplier_target: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.01,
            profit_target_pct: 0.02,
            trailing_stop_enabled: false,
            trailing_stop_activation_pct: 0.01,
            trailing_stop_trail_pct: 0.005,
            check_interval_seconds: 30,
            exit_on_circuit_breaker: true,
            atr_multiplier_stop: 1.5,
            atr_multiplier_target: 3.0,
        }
    }
}

/// Runtime reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Seconds between reconciliation checks (clamped to 30-300 at use).
    pub check_interval_seconds: u64,
    /// Auto-clear stuck `pending_exit` flags.
    pub repair_stuck_exits: bool,
    /// Set `trading_halted` when discrepancies are found.
    pub halt_on_discrepancy: bool,
    /// Timeout for broker calls during reconciliation.
    pub broker_timeout_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 120,
            repair_stuck_exits: true,
            halt_on_discrepancy: true,
            broker_timeout_seconds: 30,
        }
    }
}

/// Immutable engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Alpaca API key id.
    pub alpaca_api_key: String,
    /// Alpaca API secret.
    pub alpaca_secret_key: String,
    /// True for the paper endpoint.
    pub alpaca_paper: bool,
    /// Explicit confirmation required for live trading.
    pub allow_live_trading: bool,

    /// Equity symbols to trade.
    pub symbols: Vec<String>,
    /// Crypto symbols to trade (dedicated data endpoint, extended limits).
    pub crypto_symbols: Vec<String>,
    /// Bar timeframe, e.g. "1Min".
    pub bar_timeframe: String,
    /// Equity data feed: "iex" (free) or "sip" (premium).
    pub stream_feed: String,
    /// Symbols per batch bar request on the premium feed.
    pub batch_size: usize,

    /// Strategy identifier (namespaces order ids and signal gates).
    pub strategy_name: String,
    /// Cooldown between accepted entries per (strategy, symbol, action).
    pub signal_cooldown_seconds: i64,

    /// Limits applied during regular hours.
    pub regular_limits: RiskLimits,
    /// Limits applied during extended hours and for crypto.
    pub extended_limits: RiskLimits,
    /// Tier-3 filters.
    pub filters: FilterConfig,
    /// Exit settings.
    pub exits: ExitConfig,
    /// Runtime reconciler settings.
    pub reconciler: ReconcilerConfig,

    /// Order type submitted for signals ("market" or "limit").
    pub order_type: String,
    /// Time in force for submitted orders.
    pub time_in_force: String,

    /// Persist intents but skip broker submission.
    pub dry_run: bool,
    /// Kill switch set by env at load time (the sentinel file is rechecked
    /// live on every signal).
    pub kill_switch: bool,
    /// Clear the persisted circuit-breaker state at startup.
    pub circuit_breaker_reset: bool,
    /// Path of the SQLite database.
    pub database_path: PathBuf,
    /// Kill-switch sentinel file path.
    pub kill_switch_file: PathBuf,
    /// Slack webhook for critical alerts; `None` logs only.
    pub alert_webhook_url: Option<String>,
    /// Log level directive.
    pub log_level: String,
}

impl Config {
    /// True only when both live-trading gates are open.
    #[must_use]
    pub fn is_live_trading_enabled(&self) -> bool {
        !self.alpaca_paper && self.allow_live_trading
    }

    /// Load and validate configuration from the environment.
    pub fn from_env() -> Result<Self, EngineError> {
        let alpaca_api_key = require_env("ALPACA_API_KEY")?;
        let alpaca_secret_key = require_env("ALPACA_SECRET_KEY")?;

        let alpaca_paper = env_bool("ALPACA_PAPER", true);
        let allow_live_trading = env_bool("ALLOW_LIVE_TRADING", false);
        if !alpaca_paper && !allow_live_trading {
            return Err(EngineError::Config(
                "UNSAFE CONFIGURATION: ALPACA_PAPER=false but ALLOW_LIVE_TRADING=false. \
                 Set ALPACA_PAPER=true for paper trading, or ALLOW_LIVE_TRADING=true to \
                 explicitly confirm live trading."
                    .to_string(),
            ));
        }

        let symbols = split_symbols(&env_or("SYMBOLS", "AAPL,MSFT"));
        if symbols.is_empty() {
            return Err(EngineError::Config(
                "SYMBOLS must contain at least one symbol".to_string(),
            ));
        }
        let crypto_symbols = split_symbols(&env_or("CRYPTO_SYMBOLS", ""));

        let bar_timeframe = env_or("BAR_TIMEFRAME", "1Min");
        if !VALID_TIMEFRAMES.contains(&bar_timeframe.as_str()) {
            return Err(EngineError::Config(format!(
                "BAR_TIMEFRAME must be one of: {}",
                VALID_TIMEFRAMES.join(", ")
            )));
        }

        let stream_feed = env_or("STREAM_FEED", "iex").to_lowercase();
        if !VALID_FEEDS.contains(&stream_feed.as_str()) {
            return Err(EngineError::Config(format!(
                "STREAM_FEED must be one of: {}",
                VALID_FEEDS.join(", ")
            )));
        }

        let regular_limits = RiskLimits {
            max_position_pct: env_f64("MAX_POSITION_PCT", 0.10)?,
            max_daily_loss_pct: env_f64("MAX_DAILY_LOSS_PCT", 0.05)?,
            max_trades_per_day: env_u32("MAX_TRADES_PER_DAY", 20)?,
            max_concurrent_positions: env_u32("MAX_CONCURRENT_POSITIONS", 10)? as usize,
        };
        validate_pct("MAX_POSITION_PCT", regular_limits.max_position_pct)?;
        validate_pct("MAX_DAILY_LOSS_PCT", regular_limits.max_daily_loss_pct)?;
        if regular_limits.max_trades_per_day == 0 {
            return Err(EngineError::Config(
                "MAX_TRADES_PER_DAY must be positive".to_string(),
            ));
        }

        // Extended-hours limits default to half the regular trade budget
        // unless overridden.
        let extended_limits = RiskLimits {
            max_position_pct: env_f64("EXT_MAX_POSITION_PCT", regular_limits.max_position_pct)?,
            max_daily_loss_pct: env_f64(
                "EXT_MAX_DAILY_LOSS_PCT",
                regular_limits.max_daily_loss_pct,
            )?,
            max_trades_per_day: env_u32(
                "EXT_MAX_TRADES_PER_DAY",
                regular_limits.max_trades_per_day.div_ceil(2),
            )?,
            max_concurrent_positions: env_u32(
                "EXT_MAX_CONCURRENT_POSITIONS",
                regular_limits.max_concurrent_positions as u32,
            )? as usize,
        };

        let filters = FilterConfig {
            max_spread_pct: env_opt_f64("MAX_SPREAD_PCT")?,
            min_bar_trades: env_opt_u64("MIN_BAR_TRADES")?,
            avoid_first_minutes: i64::from(env_u32("AVOID_FIRST_MINUTES", 0)?),
            avoid_last_minutes: i64::from(env_u32("AVOID_LAST_MINUTES", 0)?),
        };

        let exits = ExitConfig {
            stop_loss_pct: env_f64("STOP_LOSS_PCT", 0.01)?,
            profit_target_pct: env_f64("PROFIT_TARGET_PCT", 0.02)?,
            trailing_stop_enabled: env_bool("TRAILING_STOP_ENABLED", false),
            trailing_stop_activation_pct: env_f64("TRAILING_STOP_ACTIVATION_PCT", 0.01)?,
            trailing_stop_trail_pct: env_f64("TRAILING_STOP_TRAIL_PCT", 0.005)?,
            check_interval_seconds: u64::from(env_u32("EXIT_CHECK_INTERVAL_SECONDS", 30)?),
            exit_on_circuit_breaker: env_bool("EXIT_ON_CIRCUIT_BREAKER", true),
            atr_multiplier_stop: env_f64("ATR_MULTIPLIER_STOP", 1.5)?,
            atr_multiplier_target: env_f64("ATR_MULTIPLIER_TARGET", 3.0)?,
        };

        let reconciler = ReconcilerConfig {
            check_interval_seconds: u64::from(env_u32("RECONCILER_INTERVAL_SECONDS", 120)?),
            repair_stuck_exits: env_bool("RECONCILER_REPAIR_STUCK_EXITS", true),
            halt_on_discrepancy: env_bool("RECONCILER_HALT_ON_DISCREPANCY", true),
            broker_timeout_seconds: u64::from(env_u32("RECONCILER_BROKER_TIMEOUT_SECONDS", 30)?),
        };

        let log_level = env_or("LOG_LEVEL", "info").to_lowercase();

        let kill_switch_file = PathBuf::from(env_or("KILL_SWITCH_FILE", KILL_SWITCH_FILE));
        let kill_switch =
            kill_switch_file.exists() || env_bool("KILL_SWITCH", false);

        Ok(Self {
            alpaca_api_key,
            alpaca_secret_key,
            alpaca_paper,
            allow_live_trading,
            symbols,
            crypto_symbols,
            bar_timeframe,
            stream_feed,
            batch_size: env_u32("BAR_BATCH_SIZE", 25)? as usize,
            strategy_name: env_or("STRATEGY_NAME", "sma_crossover"),
            signal_cooldown_seconds: i64::from(env_u32("SIGNAL_COOLDOWN_SECONDS", 300)?),
            regular_limits,
            extended_limits,
            filters,
            exits,
            reconciler,
            order_type: env_or("ORDER_TYPE", "market"),
            time_in_force: env_or("TIME_IN_FORCE", "day"),
            dry_run: env_bool("DRY_RUN", false),
            kill_switch,
            circuit_breaker_reset: env_bool("CIRCUIT_BREAKER_RESET", false),
            database_path: PathBuf::from(env_or("DATABASE_PATH", "data/trading.db")),
            kill_switch_file,
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            log_level,
        })
    }
}

fn require_env(key: &str) -> Result<String, EngineError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EngineError::Config(format!(
            "Missing required environment variable: {key}"
        ))),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map_or(default, |v| v.trim().eq_ignore_ascii_case("true"))
}

fn env_f64(key: &str, default: f64) -> Result<f64, EngineError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<f64>()
            .map_err(|e| EngineError::Config(format!("Invalid numeric value for {key}: {e}"))),
        _ => Ok(default),
    }
}

fn env_opt_f64(key: &str) -> Result<Option<f64>, EngineError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("Invalid numeric value for {key}: {e}"))),
        _ => Ok(None),
    }
}

fn env_opt_u64(key: &str) -> Result<Option<u64>, EngineError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("Invalid numeric value for {key}: {e}"))),
        _ => Ok(None),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, EngineError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<u32>()
            .map_err(|e| EngineError::Config(format!("Invalid numeric value for {key}: {e}"))),
        _ => Ok(default),
    }
}

fn validate_pct(key: &str, value: f64) -> Result<(), EngineError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "{key} must be between 0 and 1"
        )))
    }
}

fn split_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect()
}

/// True when the kill-switch sentinel file currently exists.
///
/// Re-evaluated on every signal, never cached at startup.
#[must_use]
pub fn kill_switch_file_present(path: &Path) -> bool {
    path.exists()
}
