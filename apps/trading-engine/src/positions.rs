//! Position tracking: entry, extreme price, trailing stops, pending-exit
//! state. In-memory map is primary; every state change is persisted so a
//! restart reloads identical positions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::broker::Broker;
use crate::error::EngineError;
use crate::store::{StateStore, StoreError};

/// Broker-vs-tracker quantity tolerance. Fractional-share brokers may need
/// a different value; tune it here.
pub const QTY_MATCH_TOLERANCE: f64 = 1e-4;

/// Which way a position points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    /// Long position; closed by selling.
    Long,
    /// Short position; closed by buying.
    Short,
}

impl PositionSide {
    /// Lowercase name as persisted.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Parse a persisted side string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

/// A tracked position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionData {
    /// Symbol; at most one tracked position per symbol.
    pub symbol: String,
    /// Direction.
    pub side: PositionSide,
    /// Absolute quantity; always positive.
    pub qty: Decimal,
    /// Entry fill price.
    pub entry_price: f64,
    /// Entry time.
    pub entry_time: DateTime<Utc>,
    /// Most favourable price seen: max for longs, min for shorts.
    pub extreme_price: f64,
    /// ATR captured at entry, when the signal carried one.
    pub atr: Option<f64>,
    /// Trailing stop level; moves only in the favourable direction once
    /// activated.
    pub trailing_stop_price: Option<f64>,
    /// Whether the trailing stop has activated.
    pub trailing_stop_activated: bool,
    /// True while an exit signal for this position is in flight.
    pub pending_exit: bool,
}

/// Outcome of a broker sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Symbols the broker holds that were not tracked; now tracked.
    pub new_positions: Vec<String>,
    /// Symbols tracked locally but absent at the broker; now dropped.
    pub removed_positions: Vec<String>,
    /// Quantity mismatches beyond tolerance.
    pub mismatches: Vec<QtyMismatch>,
    /// Positions tracked after the sync.
    pub total_tracked: usize,
}

/// A broker-vs-tracker quantity mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct QtyMismatch {
    /// Symbol.
    pub symbol: String,
    /// Absolute quantity at the broker.
    pub broker_qty: Decimal,
    /// Quantity tracked locally.
    pub tracked_qty: Decimal,
}

/// Tracks open positions and their exit-related state.
pub struct PositionTracker {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
    positions: Mutex<HashMap<String, PositionData>>,
    trailing_stop_enabled: bool,
    trailing_stop_activation_pct: f64,
    trailing_stop_trail_pct: f64,
}

impl PositionTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<StateStore>,
        trailing_stop_enabled: bool,
        trailing_stop_activation_pct: f64,
        trailing_stop_trail_pct: f64,
    ) -> Self {
        Self {
            broker,
            store,
            positions: Mutex::new(HashMap::new()),
            trailing_stop_enabled,
            trailing_stop_activation_pct,
            trailing_stop_trail_pct,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PositionData>> {
        self.positions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Begin tracking a position after an entry fill.
    pub fn start_tracking(
        &self,
        symbol: &str,
        fill_price: f64,
        qty: Decimal,
        side: PositionSide,
        atr: Option<f64>,
    ) -> Result<PositionData, StoreError> {
        let position = PositionData {
            symbol: symbol.to_string(),
            side,
            qty,
            entry_price: fill_price,
            entry_time: Utc::now(),
            extreme_price: fill_price,
            atr,
            trailing_stop_price: None,
            trailing_stop_activated: false,
            pending_exit: false,
        };
        self.store.upsert_position(&position)?;
        self.lock().insert(symbol.to_string(), position.clone());
        tracing::info!(symbol, side = side.as_str(), %qty, fill_price, "Tracking position");
        Ok(position)
    }

    /// Stop tracking and delete the persisted row.
    pub fn stop_tracking(&self, symbol: &str) -> Result<(), StoreError> {
        if self.lock().remove(symbol).is_some() {
            self.store.delete_position(symbol)?;
            tracing::info!(symbol, "Stopped tracking position");
        }
        Ok(())
    }

    /// Snapshot of one tracked position.
    #[must_use]
    pub fn get_position(&self, symbol: &str) -> Option<PositionData> {
        self.lock().get(symbol).cloned()
    }

    /// Snapshot of all tracked positions.
    #[must_use]
    pub fn all_positions(&self) -> Vec<PositionData> {
        self.lock().values().cloned().collect()
    }

    /// Number of tracked positions.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    /// Set or clear the pending-exit flag and persist.
    pub fn set_pending_exit(&self, symbol: &str, pending: bool) -> Result<(), StoreError> {
        let mut positions = self.lock();
        if let Some(position) = positions.get_mut(symbol) {
            position.pending_exit = pending;
            let snapshot = position.clone();
            drop(positions);
            self.store.upsert_position(&snapshot)?;
        }
        Ok(())
    }

    /// Feed a new market price into the position.
    ///
    /// The extreme price only moves in the favourable direction, and the
    /// trailing stop, once activated, only tightens: up for longs, down
    /// for shorts.
    pub fn update_current_price(
        &self,
        symbol: &str,
        current_price: f64,
    ) -> Result<Option<PositionData>, StoreError> {
        let mut positions = self.lock();
        let Some(position) = positions.get_mut(symbol) else {
            return Ok(None);
        };

        let mut state_changed = false;
        match position.side {
            PositionSide::Long => {
                if current_price > position.extreme_price {
                    position.extreme_price = current_price;
                    state_changed = true;
                    if self.trailing_stop_enabled && position.trailing_stop_activated {
                        let candidate = current_price * (1.0 - self.trailing_stop_trail_pct);
                        if position
                            .trailing_stop_price
                            .map_or(true, |current| candidate > current)
                        {
                            position.trailing_stop_price = Some(candidate);
                        }
                    }
                }
                if self.trailing_stop_enabled
                    && !position.trailing_stop_activated
                    && position.entry_price > 0.0
                {
                    let unrealised =
                        (current_price - position.entry_price) / position.entry_price;
                    if unrealised >= self.trailing_stop_activation_pct {
                        position.trailing_stop_activated = true;
                        position.trailing_stop_price =
                            Some(current_price * (1.0 - self.trailing_stop_trail_pct));
                        state_changed = true;
                    }
                }
            }
            PositionSide::Short => {
                if current_price < position.extreme_price {
                    position.extreme_price = current_price;
                    state_changed = true;
                    if self.trailing_stop_enabled && position.trailing_stop_activated {
                        let candidate = current_price * (1.0 + self.trailing_stop_trail_pct);
                        if position
                            .trailing_stop_price
                            .map_or(true, |current| candidate < current)
                        {
                            position.trailing_stop_price = Some(candidate);
                        }
                    }
                }
                if self.trailing_stop_enabled
                    && !position.trailing_stop_activated
                    && position.entry_price > 0.0
                {
                    let unrealised =
                        (position.entry_price - current_price) / position.entry_price;
                    if unrealised >= self.trailing_stop_activation_pct {
                        position.trailing_stop_activated = true;
                        position.trailing_stop_price =
                            Some(current_price * (1.0 + self.trailing_stop_trail_pct));
                        state_changed = true;
                    }
                }
            }
        }

        let snapshot = position.clone();
        drop(positions);
        if state_changed {
            self.store.upsert_position(&snapshot)?;
        }
        Ok(Some(snapshot))
    }

    /// Side-aware unrealised P&L: (amount, fraction of entry).
    ///
    /// Unknown symbols and non-positive entry prices return `(0, 0)`.
    #[must_use]
    pub fn calculate_pnl(&self, symbol: &str, current_price: f64) -> (f64, f64) {
        let positions = self.lock();
        let Some(position) = positions.get(symbol) else {
            return (0.0, 0.0);
        };
        if position.entry_price <= 0.0 {
            return (0.0, 0.0);
        }
        let price_diff = match position.side {
            PositionSide::Long => current_price - position.entry_price,
            PositionSide::Short => position.entry_price - current_price,
        };
        let qty = position.qty.to_f64().unwrap_or(0.0);
        (price_diff * qty, price_diff / position.entry_price)
    }

    /// Load persisted positions into memory. Returns how many were loaded.
    pub fn load_persisted(&self) -> Result<usize, StoreError> {
        let rows = self.store.load_positions()?;
        let count = rows.len();
        let mut positions = self.lock();
        for row in rows {
            positions.insert(row.symbol.clone(), row);
        }
        Ok(count)
    }

    /// Reconcile tracked positions against the broker.
    ///
    /// Tracks positions the broker holds that we do not, drops positions
    /// the broker no longer holds, and reports quantity mismatches beyond
    /// [`QTY_MATCH_TOLERANCE`].
    pub async fn sync_with_broker(&self) -> Result<SyncReport, EngineError> {
        let broker_positions = self.broker.get_positions().await?;
        let broker_symbols: HashSet<String> = broker_positions
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        let tracked_symbols: HashSet<String> = self.lock().keys().cloned().collect();

        let mut report = SyncReport::default();

        for position in &broker_positions {
            if !tracked_symbols.contains(&position.symbol) {
                let side = if position.qty < Decimal::ZERO {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                };
                self.start_tracking(
                    &position.symbol,
                    position.avg_entry_price,
                    position.qty.abs(),
                    side,
                    None,
                )?;
                report.new_positions.push(position.symbol.clone());
            }
        }

        for symbol in &tracked_symbols {
            if !broker_symbols.contains(symbol) {
                self.stop_tracking(symbol)?;
                report.removed_positions.push(symbol.clone());
            }
        }

        for position in &broker_positions {
            if let Some(tracked) = self.get_position(&position.symbol) {
                let broker_abs = position.qty.abs().to_f64().unwrap_or(0.0);
                let tracked_qty = tracked.qty.to_f64().unwrap_or(0.0);
                if (broker_abs - tracked_qty).abs() > QTY_MATCH_TOLERANCE {
                    report.mismatches.push(QtyMismatch {
                        symbol: position.symbol.clone(),
                        broker_qty: position.qty.abs(),
                        tracked_qty: tracked.qty,
                    });
                }
            }
        }

        report.total_tracked = self.tracked_count();
        if !report.new_positions.is_empty()
            || !report.removed_positions.is_empty()
            || !report.mismatches.is_empty()
        {
            tracing::warn!(
                new = report.new_positions.len(),
                removed = report.removed_positions.len(),
                mismatches = report.mismatches.len(),
                "Position sync diverged from broker"
            );
        }
        Ok(report)
    }
}
