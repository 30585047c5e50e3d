//! Exit evaluation: periodic position monitoring with stop-loss, trailing
//! stop, and profit-target rules.
//!
//! Rule priority is stop loss > trailing stop > profit target. When a
//! position carries a finite positive ATR, ATR-based thresholds replace
//! the fixed-percentage stop and target; trailing-stop logic runs either
//! way. An exit signal marks the position `pending_exit` only after the
//! publish succeeds, so a failed publish leaves the position retryable on
//! the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::broker::{Broker, OrderSide};
use crate::config::ExitConfig;
use crate::data::snapshot_price;
use crate::events::{Event, EventBus, ExitSignalEvent};
use crate::positions::{PositionData, PositionSide, PositionTracker};
use crate::store::StateStore;

/// Why an exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop-loss threshold crossed.
    StopLoss,
    /// Profit target reached.
    ProfitTarget,
    /// Trailing stop crossed.
    TrailingStop,
    /// Circuit breaker tripped; closing everything.
    CircuitBreaker,
    /// Operator-requested emergency close.
    Emergency,
    /// Graceful shutdown flatten.
    Shutdown,
}

impl ExitReason {
    /// Snake-case name used in events, logs, and reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::ProfitTarget => "profit_target",
            Self::TrailingStop => "trailing_stop",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Emergency => "emergency",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ATR-based stop and target prices for a position side.
///
/// Long: stop below entry, target above. Short: inverted.
#[must_use]
pub fn dynamic_stops(
    entry_price: f64,
    atr: f64,
    atr_multiplier_stop: f64,
    atr_multiplier_target: f64,
    side: PositionSide,
) -> (f64, f64) {
    let stop_distance = atr * atr_multiplier_stop;
    let target_distance = atr * atr_multiplier_target;
    match side {
        PositionSide::Long => (entry_price - stop_distance, entry_price + target_distance),
        PositionSide::Short => (entry_price + stop_distance, entry_price - target_distance),
    }
}

/// Periodic exit evaluator.
pub struct ExitManager {
    broker: Arc<dyn Broker>,
    tracker: Arc<PositionTracker>,
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    config: ExitConfig,
}

impl ExitManager {
    /// Create an exit manager.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        tracker: Arc<PositionTracker>,
        bus: Arc<EventBus>,
        store: Arc<StateStore>,
        config: ExitConfig,
    ) -> Self {
        Self {
            broker,
            tracker,
            bus,
            store,
            config,
        }
    }

    /// One evaluation tick over all tracked positions.
    ///
    /// Returns the exit signals that were successfully published.
    pub async fn check_positions(&self) -> Vec<ExitSignalEvent> {
        let mut published = Vec::new();
        let positions = self.tracker.all_positions();
        if positions.is_empty() {
            return published;
        }

        match self.broker.get_clock().await {
            Ok(clock) if !clock.is_open => {
                tracing::debug!("Market closed; skipping position checks");
                return published;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to check market clock");
                return published;
            }
            Ok(_) => {}
        }

        for position in positions {
            // An exit for this position is already in flight.
            if position.pending_exit {
                tracing::debug!(symbol = position.symbol, "Exit signal pending; skipping");
                continue;
            }

            let snapshot = match self.broker.get_snapshot(&position.symbol).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(symbol = position.symbol, error = %err, "Snapshot fetch failed");
                    continue;
                }
            };
            let Some(current_price) = snapshot_price(&snapshot) else {
                tracing::warn!(symbol = position.symbol, "No current price available");
                continue;
            };

            let updated = match self
                .tracker
                .update_current_price(&position.symbol, current_price)
            {
                Ok(Some(updated)) => updated,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(symbol = position.symbol, error = %err, "Price update failed");
                    continue;
                }
            };

            let Some(signal) = self.evaluate_exit_rules(&updated, current_price) else {
                continue;
            };

            // Publish first; only a delivered signal marks the position.
            match self.bus.publish(Event::ExitSignal(signal.clone())).await {
                Ok(()) => {
                    if let Err(err) = self.tracker.set_pending_exit(&position.symbol, true) {
                        tracing::error!(symbol = position.symbol, error = %err, "Failed to persist pending_exit");
                    }
                    tracing::info!(
                        symbol = signal.symbol,
                        reason = %signal.reason,
                        pnl_pct = signal.pnl_pct * 100.0,
                        "Exit signal"
                    );
                    published.push(signal);
                }
                Err(err) => {
                    tracing::error!(
                        symbol = position.symbol,
                        error = %err,
                        "Failed to publish exit signal; will retry next tick"
                    );
                }
            }
        }
        published
    }

    /// Evaluate exit rules for a position at a price.
    #[must_use]
    pub fn evaluate_exit_rules(
        &self,
        position: &PositionData,
        current_price: f64,
    ) -> Option<ExitSignalEvent> {
        let (pnl_amount, pnl_pct) = self.tracker.calculate_pnl(&position.symbol, current_price);

        // Finite positive ATR replaces both fixed-percentage thresholds.
        let atr_thresholds = position
            .atr
            .filter(|atr| atr.is_finite() && *atr > 0.0)
            .map(|atr| {
                dynamic_stops(
                    position.entry_price,
                    atr,
                    self.config.atr_multiplier_stop,
                    self.config.atr_multiplier_target,
                    position.side,
                )
            })
            .filter(|(stop, target)| stop.is_finite() && target.is_finite());

        // Priority 1: stop loss.
        let stop_hit = match atr_thresholds {
            Some((stop, _)) => match position.side {
                PositionSide::Long => current_price <= stop,
                PositionSide::Short => current_price >= stop,
            },
            None => pnl_pct <= -self.config.stop_loss_pct,
        };
        if stop_hit {
            return Some(self.exit_signal(position, current_price, pnl_amount, pnl_pct, ExitReason::StopLoss));
        }

        // Priority 2: trailing stop, evaluated regardless of the ATR path.
        if self.config.trailing_stop_enabled && position.trailing_stop_activated {
            if let Some(trailing) = position.trailing_stop_price.filter(|p| p.is_finite()) {
                let crossed = match position.side {
                    PositionSide::Long => current_price <= trailing,
                    PositionSide::Short => current_price >= trailing,
                };
                if crossed {
                    return Some(self.exit_signal(
                        position,
                        current_price,
                        pnl_amount,
                        pnl_pct,
                        ExitReason::TrailingStop,
                    ));
                }
            }
        }

        // Priority 3: profit target.
        let target_hit = match atr_thresholds {
            Some((_, target)) => match position.side {
                PositionSide::Long => current_price >= target,
                PositionSide::Short => current_price <= target,
            },
            None => pnl_pct >= self.config.profit_target_pct,
        };
        if target_hit {
            return Some(self.exit_signal(
                position,
                current_price,
                pnl_amount,
                pnl_pct,
                ExitReason::ProfitTarget,
            ));
        }

        None
    }

    fn exit_signal(
        &self,
        position: &PositionData,
        current_price: f64,
        pnl_amount: f64,
        pnl_pct: f64,
        reason: ExitReason,
    ) -> ExitSignalEvent {
        ExitSignalEvent {
            symbol: position.symbol.clone(),
            side: match position.side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            },
            qty: position.qty,
            reason,
            entry_price: position.entry_price,
            current_price,
            pnl_pct,
            pnl_amount,
            timestamp: Utc::now(),
        }
    }

    /// Publish an exit signal for every tracked position.
    pub async fn close_all_positions(&self, reason: ExitReason) -> Vec<ExitSignalEvent> {
        tracing::warn!(%reason, "Closing all positions");
        let mut signals = Vec::new();

        for position in self.tracker.all_positions() {
            let current_price = match self.broker.get_snapshot(&position.symbol).await {
                Ok(snapshot) => snapshot_price(&snapshot).unwrap_or(position.entry_price),
                Err(_) => position.entry_price,
            };
            let (pnl_amount, pnl_pct) =
                self.tracker.calculate_pnl(&position.symbol, current_price);
            let signal = self.exit_signal(&position, current_price, pnl_amount, pnl_pct, reason);

            match self.bus.publish(Event::ExitSignal(signal.clone())).await {
                Ok(()) => {
                    tracing::info!(
                        symbol = signal.symbol,
                        %reason,
                        pnl_pct = signal.pnl_pct * 100.0,
                        "Emergency exit signal"
                    );
                    signals.push(signal);
                }
                Err(err) => {
                    tracing::error!(symbol = position.symbol, error = %err, "Failed to publish emergency exit");
                }
            }
        }

        tracing::warn!(count = signals.len(), %reason, "Emergency exit signals generated");
        signals
    }

    /// Monitoring loop: honours the circuit breaker, then evaluates all
    /// positions every `check_interval_seconds`.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            stop_loss_pct = self.config.stop_loss_pct,
            profit_target_pct = self.config.profit_target_pct,
            trailing = self.config.trailing_stop_enabled,
            interval = self.config.check_interval_seconds,
            "Exit manager started"
        );
        let interval = Duration::from_secs(self.config.check_interval_seconds.max(1));
        loop {
            if self.config.exit_on_circuit_breaker {
                match self.store.get_state("circuit_breaker_state") {
                    Ok(state) if state.as_deref() == Some("tripped") => {
                        tracing::warn!("Circuit breaker tripped; closing all positions");
                        self.close_all_positions(ExitReason::CircuitBreaker).await;
                        tokio::time::sleep(interval).await;
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Circuit breaker state read failed");
                    }
                    Ok(_) => {}
                }
            }
            self.check_positions().await;
            tokio::time::sleep(interval).await;
        }
    }
}
