//! Layered risk gates, checked in a fixed order per incoming signal:
//!
//! 1. SAFETY (hard refuse): kill-switch, circuit breaker, trading halt,
//!    market clock. The kill-switch sentinel file is re-read on every
//!    signal, never cached.
//! 2. RISK (hard refuse): session-aware daily loss, trade count, and
//!    concurrent-position limits.
//! 3. CONFIDENCE + FILTER (soft skip): confidence threshold, spread,
//!    bar liquidity, time-of-day.
//!
//! Exit orders undergo tier 1's kill-switch and market-open checks only;
//! an exit must be able to run while the circuit breaker is tripped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use thiserror::Error;

use crate::broker::Broker;
use crate::config::{Config, FilterConfig, RiskLimits};
use crate::data::PriceHistory;
use crate::events::SignalEvent;
use crate::store::{StateStore, StoreError};

/// Signals below this confidence are skipped.
pub const MIN_CONFIDENCE: f64 = 0.5;

/// Hard refusals from the safety and risk tiers.
#[derive(Debug, Error)]
pub enum RiskError {
    /// Manual brake engaged via state key or sentinel file.
    #[error("Kill-switch active")]
    KillSwitch,

    /// Too many consecutive submission failures.
    #[error("Circuit breaker tripped")]
    CircuitBreaker,

    /// Runtime reconciliation found unresolved discrepancies.
    #[error("Trading halted pending reconciliation")]
    TradingHalted,

    /// The market clock says closed.
    #[error("Market not open")]
    MarketClosed,

    /// The market clock could not be fetched; treated as closed.
    #[error("Clock fetch failed: {0}")]
    ClockUnavailable(String),

    /// Daily loss limit breached.
    #[error("Daily loss limit exceeded: {pnl:.2}")]
    DailyLossExceeded {
        /// Current daily P&L.
        pnl: f64,
    },

    /// Daily trade budget spent.
    #[error("Daily trade count exceeded: {count}")]
    TradeCountExceeded {
        /// Trades recorded today.
        count: u32,
    },

    /// Too many open positions.
    #[error("Concurrent positions limit reached: {count}")]
    ConcurrentPositionsExceeded {
        /// Open positions at the broker.
        count: usize,
    },

    /// A required filter's data source failed; the filter cannot be
    /// silently bypassed.
    #[error("Required filter data unavailable: {0}")]
    FilterUnavailable(String),

    /// A risk-tier data fetch failed.
    #[error("Risk tier check failed: {0}")]
    CheckFailed(String),

    /// State store failure during a check.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Soft outcomes from the filter tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// Signal confidence below [`MIN_CONFIDENCE`].
    LowConfidence(f64),
    /// Quoted spread above the configured maximum.
    SpreadTooWide(f64),
    /// Last bar's trade count below the configured minimum.
    ThinBar(u64),
    /// Inside the avoid-first/avoid-last window around open or close.
    TimeOfDay,
}

/// Outcome of a full signal check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalDecision {
    /// All gates passed; submit the order.
    Proceed,
    /// Filtered; discard the signal without error.
    Skip(SkipReason),
}

/// Trading session partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    /// 09:30-16:00 America/New_York, equities only.
    Regular,
    /// Everything else, and all crypto.
    Extended,
}

fn ny_time(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    New_York
        .from_local_datetime(&date.and_hms_opt(hour, minute, 0)?)
        .single()
}

/// Classify an instant into regular or extended hours by real datetime
/// comparison in America/New_York. 09:30:00 is regular; 16:00:00 is not.
#[must_use]
pub fn session_at(now_utc: DateTime<Utc>) -> Session {
    let now_et = now_utc.with_timezone(&New_York);
    let date = now_et.date_naive();
    match (ny_time(date, 9, 30), ny_time(date, 16, 0)) {
        (Some(open), Some(close)) if now_et >= open && now_et < close => Session::Regular,
        _ => Session::Extended,
    }
}

/// True when the instant falls inside the avoid-first/avoid-last window
/// around the regular session boundaries.
#[must_use]
pub fn in_avoid_window(now_utc: DateTime<Utc>, avoid_first: i64, avoid_last: i64) -> bool {
    if avoid_first <= 0 && avoid_last <= 0 {
        return false;
    }
    let now_et = now_utc.with_timezone(&New_York);
    let date = now_et.date_naive();
    let (Some(open), Some(close)) = (ny_time(date, 9, 30), ny_time(date, 16, 0)) else {
        return false;
    };
    let minutes_since_open = (now_et - open).num_seconds() as f64 / 60.0;
    let minutes_until_close = (close - now_et).num_seconds() as f64 / 60.0;
    minutes_since_open < avoid_first as f64 || minutes_until_close < avoid_last as f64
}

/// Three-tier risk gate.
pub struct RiskManager {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
    history: Arc<PriceHistory>,
    regular_limits: RiskLimits,
    extended_limits: RiskLimits,
    crypto_symbols: HashSet<String>,
    filters: FilterConfig,
    kill_switch_file: PathBuf,
}

impl RiskManager {
    /// Create a risk manager from the loaded configuration.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<StateStore>,
        history: Arc<PriceHistory>,
        config: &Config,
    ) -> Self {
        Self {
            broker,
            store,
            history,
            regular_limits: config.regular_limits.clone(),
            extended_limits: config.extended_limits.clone(),
            crypto_symbols: config.crypto_symbols.iter().cloned().collect(),
            filters: config.filters.clone(),
            kill_switch_file: config.kill_switch_file.clone(),
        }
    }

    /// Session for a symbol right now: crypto is always extended.
    #[must_use]
    pub fn session_for(&self, symbol: &str) -> Session {
        if self.crypto_symbols.contains(symbol) {
            Session::Extended
        } else {
            session_at(Utc::now())
        }
    }

    fn limits_for(&self, symbol: &str) -> &RiskLimits {
        match self.session_for(symbol) {
            Session::Regular => &self.regular_limits,
            Session::Extended => &self.extended_limits,
        }
    }

    /// Run a signal through all three tiers.
    pub async fn check_signal(&self, signal: &SignalEvent) -> Result<SignalDecision, RiskError> {
        self.check_safety_tier().await?;
        self.check_risk_tier(&signal.symbol).await?;
        self.check_filter_tier(signal).await
    }

    /// Tier-1-only validation for exit orders: kill-switch and market open.
    pub async fn check_exit_order(&self, symbol: &str) -> Result<(), RiskError> {
        if self.kill_switch_engaged()? {
            tracing::error!(symbol, "Exit blocked by kill-switch");
            return Err(RiskError::KillSwitch);
        }
        self.check_market_open().await?;
        tracing::debug!(symbol, "Exit order validated");
        Ok(())
    }

    fn kill_switch_engaged(&self) -> Result<bool, RiskError> {
        // The sentinel file is checked live so an operator can stop trading
        // by touching a file, without restarting anything.
        if self.kill_switch_file.exists() {
            return Ok(true);
        }
        Ok(self.store.get_state("kill_switch")?.as_deref() == Some("true"))
    }

    async fn check_market_open(&self) -> Result<(), RiskError> {
        let clock = self
            .broker
            .get_clock()
            .await
            .map_err(|e| RiskError::ClockUnavailable(e.to_string()))?;
        if clock.is_open {
            Ok(())
        } else {
            Err(RiskError::MarketClosed)
        }
    }

    async fn check_safety_tier(&self) -> Result<(), RiskError> {
        if self.kill_switch_engaged()? {
            return Err(RiskError::KillSwitch);
        }
        if self.store.get_state("circuit_breaker_state")?.as_deref() == Some("tripped") {
            return Err(RiskError::CircuitBreaker);
        }
        if self.store.get_state("trading_halted")?.as_deref() == Some("true") {
            return Err(RiskError::TradingHalted);
        }
        self.check_market_open().await
    }

    async fn check_risk_tier(&self, symbol: &str) -> Result<(), RiskError> {
        let limits = self.limits_for(symbol).clone();

        let account = self
            .broker
            .get_account()
            .await
            .map_err(|e| RiskError::CheckFailed(format!("account fetch: {e}")))?;

        let daily_pnl = self.store.get_daily_pnl()?;
        let max_daily_loss = account.equity * limits.max_daily_loss_pct;
        if daily_pnl < -max_daily_loss {
            return Err(RiskError::DailyLossExceeded { pnl: daily_pnl });
        }

        let trade_count = self.store.get_daily_trade_count()?;
        if trade_count >= limits.max_trades_per_day {
            return Err(RiskError::TradeCountExceeded { count: trade_count });
        }

        let positions = self
            .broker
            .get_positions()
            .await
            .map_err(|e| RiskError::CheckFailed(format!("positions fetch: {e}")))?;
        if positions.len() >= limits.max_concurrent_positions {
            return Err(RiskError::ConcurrentPositionsExceeded {
                count: positions.len(),
            });
        }
        Ok(())
    }

    async fn check_filter_tier(&self, signal: &SignalEvent) -> Result<SignalDecision, RiskError> {
        let confidence = signal.metadata.confidence;
        if confidence < MIN_CONFIDENCE {
            tracing::warn!(
                symbol = signal.symbol,
                confidence,
                "Signal filtered: confidence below threshold"
            );
            return Ok(SignalDecision::Skip(SkipReason::LowConfidence(confidence)));
        }

        if let Some(max_spread_pct) = self.filters.max_spread_pct {
            let snapshot = self
                .broker
                .get_snapshot(&signal.symbol)
                .await
                .map_err(|e| {
                    RiskError::FilterUnavailable(format!(
                        "spread filter enabled but snapshot fetch failed for {}: {e}",
                        signal.symbol
                    ))
                })?;
            let (Some(bid), Some(ask)) = (snapshot.bid, snapshot.ask) else {
                return Err(RiskError::FilterUnavailable(format!(
                    "invalid spread data for {}",
                    signal.symbol
                )));
            };
            if bid <= 0.0 {
                return Err(RiskError::FilterUnavailable(format!(
                    "invalid spread data for {}",
                    signal.symbol
                )));
            }
            let spread_pct = (ask - bid) / bid;
            if spread_pct > max_spread_pct {
                tracing::info!(
                    symbol = signal.symbol,
                    spread_pct,
                    max_spread_pct,
                    "Signal skipped: spread too wide"
                );
                return Ok(SignalDecision::Skip(SkipReason::SpreadTooWide(spread_pct)));
            }
        }

        if let Some(min_trades) = self.filters.min_bar_trades {
            if let Some(trade_count) = self.history.last_trade_count(&signal.symbol) {
                if trade_count < min_trades {
                    tracing::info!(
                        symbol = signal.symbol,
                        trade_count,
                        min_trades,
                        "Signal skipped: bar trade count too low"
                    );
                    return Ok(SignalDecision::Skip(SkipReason::ThinBar(trade_count)));
                }
            }
        }

        if in_avoid_window(
            Utc::now(),
            self.filters.avoid_first_minutes,
            self.filters.avoid_last_minutes,
        ) {
            tracing::info!(symbol = signal.symbol, "Signal skipped: time-of-day window");
            return Ok(SignalDecision::Skip(SkipReason::TimeOfDay));
        }

        Ok(SignalDecision::Proceed)
    }
}
