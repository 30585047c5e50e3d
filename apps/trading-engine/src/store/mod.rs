//! SQLite state store: crash-safe persistence for order intents, fills,
//! trades, positions, signal gates, daily counters, and bot state.
//!
//! All writes are idempotent upserts or conflict-tolerant inserts; the
//! cumulative-fill path is monotonic by construction. Access goes through
//! one connection behind a mutex -- operations are short, and WAL keeps
//! readers unblocked.

pub mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::broker::{BrokerPosition, OrderSide};
use crate::positions::{PositionData, PositionSide};
use crate::util::parse_optional_f64;

/// Order-intent statuses the order-update poller still watches.
pub const OPEN_ORDER_STATUSES: &[&str] =
    &["submitted", "pending", "accepted", "new", "partially_filled"];

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("State store SQL error: {0}")]
    Sqlite(String),

    /// A stored value could not be interpreted.
    #[error("State store parse error: {0}")]
    Parse(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(err.to_string())
    }
}

/// An order intent row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntentRow {
    /// Deterministic client order id (primary key).
    pub client_order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Requested quantity.
    pub qty: Decimal,
    /// ATR captured at signal time, for exit thresholds.
    pub atr: Option<f64>,
    /// Lifecycle status string.
    pub status: String,
    /// Cumulative filled quantity; never decreases once set.
    pub filled_qty: Decimal,
    /// Cumulative average fill price.
    pub filled_avg_price: Option<f64>,
    /// Broker-side order id, set after submission.
    pub broker_order_id: Option<String>,
    /// Strategy namespace.
    pub strategy: String,
}

/// A new order intent to persist before submission.
#[derive(Debug, Clone)]
pub struct NewOrderIntent<'a> {
    /// Deterministic client order id.
    pub client_order_id: &'a str,
    /// Symbol.
    pub symbol: &'a str,
    /// Side.
    pub side: OrderSide,
    /// Quantity.
    pub qty: Decimal,
    /// ATR at signal time.
    pub atr: Option<f64>,
    /// Initial status (normally "new").
    pub status: &'a str,
    /// Strategy namespace.
    pub strategy: &'a str,
}

/// An immutable per-delta fill record.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
    /// Broker-side order id.
    pub broker_order_id: String,
    /// Client order id.
    pub client_order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Quantity filled by this delta; always positive.
    pub delta_qty: Decimal,
    /// Broker cumulative quantity after this fill.
    pub cum_qty: Decimal,
    /// Broker cumulative average price, when reported.
    pub cum_avg_price: Option<f64>,
    /// Observation time.
    pub timestamp: DateTime<Utc>,
    /// Broker-supplied fill id, when present.
    pub fill_id: Option<String>,
    /// True when `cum_avg_price` is an estimate rather than broker-reported.
    pub price_is_estimate: bool,
}

impl FillRecord {
    /// Dedupe key: the broker fill id when present, else a synthetic key on
    /// the cumulative quantity.
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        self.fill_id
            .clone()
            .unwrap_or_else(|| format!("CUM:{}", self.cum_qty))
    }
}

/// A completed trade row (terminal fill).
#[derive(Debug, Clone)]
pub struct TradeRecord {
    /// Fill time.
    pub timestamp: DateTime<Utc>,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Filled quantity.
    pub qty: Decimal,
    /// Fill price.
    pub price: f64,
    /// Broker-side order id.
    pub order_id: String,
    /// Client order id.
    pub client_order_id: String,
    /// Broker fill id, when present.
    pub fill_id: Option<String>,
}

/// A persisted reconciliation report row.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Report time.
    pub timestamp_utc: String,
    /// "startup" or "runtime".
    pub check_type: String,
    /// Wall time of the check.
    pub duration_ms: i64,
    /// Discrepancies found.
    pub discrepancies_count: i64,
    /// Repairs applied.
    pub repaired_count: i64,
    /// Outcome status.
    pub status: String,
    /// JSON payload of discrepancies.
    pub discrepancies_json: Option<String>,
    /// JSON payload of repairs.
    pub repairs_json: Option<String>,
    /// Error message, when the check itself failed.
    pub error_message: Option<String>,
}

/// SQLite-backed state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open the store. `ensure_schema` must have run for this path already.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Bot state (key-value)
    // ------------------------------------------------------------------

    /// Read a bot-state value.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let value = conn
            .query_row("SELECT value FROM bot_state WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Upsert a bot-state value.
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO bot_state (key, value, updated_at_utc) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Order intents
    // ------------------------------------------------------------------

    /// Persist an order intent before submission.
    ///
    /// Returns `false` when the client order id already exists -- the caller
    /// reads that as "already submitted".
    pub fn save_order_intent(&self, intent: &NewOrderIntent<'_>) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO order_intents
               (client_order_id, symbol, side, qty, atr, status, strategy,
                created_at_utc, updated_at_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            rusqlite::params![
                intent.client_order_id,
                intent.symbol,
                intent.side.as_str(),
                intent.qty.to_string(),
                intent.atr,
                intent.status,
                intent.strategy,
                now,
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_constraint_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Update an order intent; `None` fields preserve the stored value.
    pub fn update_order_intent(
        &self,
        client_order_id: &str,
        status: &str,
        filled_qty: Option<Decimal>,
        broker_order_id: Option<&str>,
        filled_avg_price: Option<f64>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE order_intents
               SET status = ?2,
                   filled_qty = COALESCE(?3, filled_qty),
                   broker_order_id = COALESCE(?4, broker_order_id),
                   filled_avg_price = COALESCE(?5, filled_avg_price),
                   updated_at_utc = ?6
             WHERE client_order_id = ?1",
            rusqlite::params![
                client_order_id,
                status,
                filled_qty.map(|q| q.to_string()),
                broker_order_id,
                filled_avg_price,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Cumulative update keyed by broker order id: `filled_qty` only moves
    /// up, so a stale poll can never regress persisted state.
    pub fn update_order_intent_cumulative(
        &self,
        broker_order_id: &str,
        status: &str,
        new_cum_qty: Decimal,
        new_cum_avg_price: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: Option<Decimal> = tx
            .query_row(
                "SELECT filled_qty FROM order_intents WHERE broker_order_id = ?1",
                [broker_order_id],
                |row| column_decimal(row, 0),
            )
            .optional()?;
        let monotonic = current.map_or(new_cum_qty, |cur| cur.max(new_cum_qty));
        tx.execute(
            "UPDATE order_intents
               SET status = ?2,
                   filled_qty = ?3,
                   filled_avg_price = COALESCE(?4, filled_avg_price),
                   updated_at_utc = ?5
             WHERE broker_order_id = ?1",
            rusqlite::params![
                broker_order_id,
                status,
                monotonic.to_string(),
                new_cum_avg_price,
                timestamp.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch one order intent.
    pub fn get_order_intent(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderIntentRow>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("{INTENT_SELECT} WHERE client_order_id = ?1"),
                [client_order_id],
                map_intent_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch all order intents, optionally filtered by status.
    pub fn get_all_order_intents(
        &self,
        status: Option<&str>,
    ) -> Result<Vec<OrderIntentRow>, StoreError> {
        let conn = self.lock();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!("{INTENT_SELECT} WHERE status = ?1"))?;
                let rows = stmt
                    .query_map([status], map_intent_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(INTENT_SELECT)?;
                let rows = stmt
                    .query_map([], map_intent_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Intents the order-update poller must track: open status and a
    /// non-empty broker order id.
    pub fn get_pollable_order_intents(&self) -> Result<Vec<OrderIntentRow>, StoreError> {
        let placeholders = OPEN_ORDER_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "{INTENT_SELECT} WHERE status IN ({placeholders}) \
             AND broker_order_id IS NOT NULL AND broker_order_id != ''"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(OPEN_ORDER_STATUSES), map_intent_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    /// Insert a fill; duplicate `(broker_order_id, dedupe_key)` returns
    /// `false` without error.
    pub fn insert_fill_idempotent(&self, fill: &FillRecord) -> Result<bool, StoreError> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO fills
               (broker_order_id, client_order_id, symbol, side, delta_qty, cum_qty,
                cum_avg_price, timestamp_utc, fill_id, price_is_estimate, fill_dedupe_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                fill.broker_order_id,
                fill.client_order_id,
                fill.symbol,
                fill.side.as_str(),
                fill.delta_qty.to_string(),
                fill.cum_qty.to_string(),
                fill.cum_avg_price,
                fill.timestamp.to_rfc3339(),
                fill.fill_id,
                i64::from(fill.price_is_estimate),
                fill.dedupe_key(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_constraint_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Number of fills recorded for an order.
    pub fn fill_count(&self, broker_order_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE broker_order_id = ?1",
            [broker_order_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    /// Record a completed trade; duplicates on either uniqueness pair are
    /// coalesced and return `false`.
    pub fn record_trade(&self, trade: &TradeRecord) -> Result<bool, StoreError> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO trades
               (timestamp_utc, symbol, side, qty, price, order_id, client_order_id, fill_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                trade.timestamp.to_rfc3339(),
                trade.symbol,
                trade.side.as_str(),
                trade.qty.to_string(),
                trade.price,
                trade.order_id,
                trade.client_order_id,
                trade.fill_id,
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_constraint_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Signal gate
    // ------------------------------------------------------------------

    /// Atomically check and record a signal acceptance.
    ///
    /// Rejects when the gate row carries the same bar timestamp (same-bar
    /// dedupe) or the cooldown window has not elapsed; otherwise upserts
    /// the row and accepts.
    pub fn gate_try_accept(
        &self,
        strategy: &str,
        symbol: &str,
        action: &str,
        now: DateTime<Utc>,
        bar_ts: Option<DateTime<Utc>>,
        cooldown: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let existing: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT last_accepted_ts_utc, last_bar_ts_utc FROM signal_gates
                 WHERE strategy = ?1 AND symbol = ?2 AND action = ?3",
                rusqlite::params![strategy, symbol, action],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((last_accepted_raw, last_bar_raw)) = existing {
            if let (Some(bar_ts), Some(last_bar_raw)) = (bar_ts, last_bar_raw.as_deref()) {
                if parse_rfc3339(last_bar_raw) == Some(bar_ts) {
                    tx.commit()?;
                    return Ok(false);
                }
            }
            if let Some(last_accepted) = parse_rfc3339(&last_accepted_raw) {
                if now.signed_duration_since(last_accepted) < cooldown {
                    tx.commit()?;
                    return Ok(false);
                }
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO signal_gates
               (strategy, symbol, action, last_accepted_ts_utc, last_bar_ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                strategy,
                symbol,
                action,
                now.to_rfc3339(),
                bar_ts.map(|t| t.to_rfc3339()),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Daily counters & circuit breaker
    // ------------------------------------------------------------------

    /// Daily P&L; defaults to zero.
    pub fn get_daily_pnl(&self) -> Result<f64, StoreError> {
        Ok(self
            .get_state("daily_pnl")?
            .as_deref()
            .and_then(|v| parse_optional_f64(Some(v)))
            .unwrap_or(0.0))
    }

    /// Persist daily P&L.
    pub fn save_daily_pnl(&self, pnl: f64) -> Result<(), StoreError> {
        self.set_state("daily_pnl", &pnl.to_string())
    }

    /// Daily trade count; defaults to zero.
    pub fn get_daily_trade_count(&self) -> Result<u32, StoreError> {
        Ok(self
            .get_state("daily_trade_count")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Persist daily trade count.
    pub fn save_daily_trade_count(&self, count: u32) -> Result<(), StoreError> {
        self.set_state("daily_trade_count", &count.to_string())
    }

    /// Reset daily P&L and trade count; the circuit-breaker count survives.
    pub fn reset_daily_state(&self) -> Result<(), StoreError> {
        self.save_daily_pnl(0.0)?;
        self.save_daily_trade_count(0)
    }

    /// Circuit-breaker failure count; defaults to zero.
    pub fn get_circuit_breaker_count(&self) -> Result<u32, StoreError> {
        Ok(self
            .get_state("circuit_breaker_count")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Persist the circuit-breaker failure count.
    pub fn save_circuit_breaker_count(&self, count: u32) -> Result<(), StoreError> {
        self.set_state("circuit_breaker_count", &count.to_string())
    }

    // ------------------------------------------------------------------
    // Last-signal memory
    // ------------------------------------------------------------------

    /// Persist the last emitted signal per symbol and SMA pair.
    pub fn save_last_signal(
        &self,
        symbol: &str,
        action: &str,
        sma_period: (usize, usize),
    ) -> Result<(), StoreError> {
        let key = format!("last_signal:{symbol}:{}:{}", sma_period.0, sma_period.1);
        self.set_state(&key, action)
    }

    /// Read the last emitted signal per symbol and SMA pair.
    pub fn get_last_signal(
        &self,
        symbol: &str,
        sma_period: (usize, usize),
    ) -> Result<Option<String>, StoreError> {
        let key = format!("last_signal:{symbol}:{}:{}", sma_period.0, sma_period.1);
        self.get_state(&key)
    }

    // ------------------------------------------------------------------
    // Position tracking
    // ------------------------------------------------------------------

    /// Upsert a tracked position.
    pub fn upsert_position(&self, position: &PositionData) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO position_tracking
               (symbol, side, qty, entry_price, atr, entry_time, extreme_price,
                trailing_stop_price, trailing_stop_activated, pending_exit, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                position.symbol,
                position.side.as_str(),
                position.qty.to_string(),
                position.entry_price,
                position.atr,
                position.entry_time.to_rfc3339(),
                position.extreme_price,
                position.trailing_stop_price,
                i64::from(position.trailing_stop_activated),
                i64::from(position.pending_exit),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete a persisted position.
    pub fn delete_position(&self, symbol: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM position_tracking WHERE symbol = ?1", [symbol])?;
        Ok(())
    }

    /// Load all persisted positions.
    pub fn load_positions(&self) -> Result<Vec<PositionData>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, side, qty, entry_price, atr, entry_time, extreme_price,
                    trailing_stop_price, trailing_stop_activated, COALESCE(pending_exit, 0)
             FROM position_tracking",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let side_raw: String = row.get(1)?;
                let entry_time_raw: String = row.get(5)?;
                Ok(PositionData {
                    symbol: row.get(0)?,
                    side: PositionSide::parse(&side_raw).unwrap_or(PositionSide::Long),
                    qty: column_decimal(row, 2)?,
                    entry_price: row.get(3)?,
                    atr: column_opt_f64(row, 4)?,
                    entry_time: parse_rfc3339(&entry_time_raw).unwrap_or_else(Utc::now),
                    extreme_price: row.get(6)?,
                    trailing_stop_price: column_opt_f64(row, 7)?,
                    trailing_stop_activated: row.get::<_, i64>(8)? != 0,
                    pending_exit: row.get::<_, i64>(9)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Symbols whose persisted position has `pending_exit` set.
    pub fn pending_exit_positions(&self) -> Result<Vec<(String, PositionSide)>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT symbol, side FROM position_tracking WHERE pending_exit = 1")?;
        let rows = stmt
            .query_map([], |row| {
                let symbol: String = row.get(0)?;
                let side_raw: String = row.get(1)?;
                Ok((symbol, PositionSide::parse(&side_raw).unwrap_or(PositionSide::Long)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clear a stuck pending-exit flag directly on the persisted row.
    pub fn clear_pending_exit(&self, symbol: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE position_tracking SET pending_exit = 0, updated_at = ?2 WHERE symbol = ?1",
            rusqlite::params![symbol, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Working exit orders (opposite side, open status) for a symbol.
    pub fn has_working_exit_order(
        &self,
        symbol: &str,
        position_side: PositionSide,
    ) -> Result<bool, StoreError> {
        let exit_side = match position_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let placeholders = OPEN_ORDER_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM order_intents
             WHERE symbol = ? AND side = ? AND status IN ({placeholders})"
        );
        let conn = self.lock();
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&symbol];
        let side_str = exit_side.as_str();
        params.push(&side_str);
        for status in OPEN_ORDER_STATUSES {
            params.push(status);
        }
        let count: i64 = conn.query_row(&sql, params.as_slice(), |row| row.get(0))?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Positions snapshot (audit trail)
    // ------------------------------------------------------------------

    /// Append a snapshot of broker positions, all rows sharing a timestamp.
    pub fn snapshot_positions(&self, positions: &[BrokerPosition]) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for position in positions {
            tx.execute(
                "INSERT INTO positions_snapshot (timestamp_utc, symbol, qty, avg_entry_price)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    now,
                    position.symbol,
                    position.qty.to_string(),
                    position.avg_entry_price,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The most recent snapshot: symbol -> (qty, avg_entry_price).
    pub fn latest_positions_snapshot(
        &self,
    ) -> Result<HashMap<String, (Decimal, f64)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, qty, avg_entry_price FROM positions_snapshot
             WHERE timestamp_utc = (SELECT MAX(timestamp_utc) FROM positions_snapshot)",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    column_decimal(row, 1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(symbol, qty, avg)| (symbol, (qty, avg)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Observability tables
    // ------------------------------------------------------------------

    /// Append an equity-curve point.
    pub fn append_equity_curve(&self, equity: f64, daily_pnl: f64) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO equity_curve (timestamp_utc, equity, daily_pnl) VALUES (?1, ?2, ?3)",
            rusqlite::params![Utc::now().to_rfc3339(), equity, daily_pnl],
        )?;
        Ok(())
    }

    /// Number of equity-curve points recorded.
    pub fn equity_curve_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM equity_curve", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Append a bar to the audit table; duplicate (symbol, timeframe, ts)
    /// rows are ignored.
    pub fn record_bar(
        &self,
        symbol: &str,
        timeframe: &str,
        bar: &crate::broker::Bar,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO bars
               (symbol, timeframe, timestamp_utc, open, high, low, close, volume, trade_count, vwap)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                symbol,
                timeframe,
                bar.timestamp.to_rfc3339(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume as i64,
                bar.trade_count.map(|c| c as i64),
                bar.vwap,
            ],
        )?;
        Ok(())
    }

    /// Persist a reconciliation report.
    pub fn insert_reconciliation_report(&self, report: &ReportRow) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO reconciliation_reports
               (timestamp_utc, check_type, duration_ms, discrepancies_count, repaired_count,
                status, discrepancies_json, repairs_json, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                report.timestamp_utc,
                report.check_type,
                report.duration_ms,
                report.discrepancies_count,
                report.repaired_count,
                report.status,
                report.discrepancies_json,
                report.repairs_json,
                report.error_message,
            ],
        )?;
        Ok(())
    }

    /// The most recent reconciliation report, if any.
    pub fn latest_reconciliation_report(&self) -> Result<Option<ReportRow>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT timestamp_utc, check_type, duration_ms, discrepancies_count,
                        repaired_count, status, discrepancies_json, repairs_json, error_message
                 FROM reconciliation_reports ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(ReportRow {
                        timestamp_utc: row.get(0)?,
                        check_type: row.get(1)?,
                        duration_ms: row.get(2)?,
                        discrepancies_count: row.get(3)?,
                        repaired_count: row.get(4)?,
                        status: row.get(5)?,
                        discrepancies_json: row.get(6)?,
                        repairs_json: row.get(7)?,
                        error_message: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

const INTENT_SELECT: &str = "SELECT client_order_id, symbol, side, qty, atr, status, \
     filled_qty, filled_avg_price, broker_order_id, strategy FROM order_intents";

fn map_intent_row(row: &Row<'_>) -> rusqlite::Result<OrderIntentRow> {
    let side_raw: String = row.get(2)?;
    Ok(OrderIntentRow {
        client_order_id: row.get(0)?,
        symbol: row.get(1)?,
        side: OrderSide::parse(&side_raw).unwrap_or(OrderSide::Buy),
        qty: column_decimal(row, 3)?,
        atr: column_opt_f64(row, 4)?,
        status: row.get(5)?,
        filled_qty: column_decimal(row, 6)?,
        filled_avg_price: column_opt_f64(row, 7)?,
        broker_order_id: row.get(8)?,
        strategy: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
    })
}

/// Read a NUMERIC column as `Decimal`, tolerating integer, real, text, and
/// NULL storage classes. NULL reads as zero.
fn column_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let value = row.get_ref(idx)?;
    let parsed = match value {
        ValueRef::Null => Some(Decimal::ZERO),
        ValueRef::Integer(i) => Some(Decimal::from(i)),
        ValueRef::Real(f) => Decimal::try_from(f).ok(),
        ValueRef::Text(t) => std::str::from_utf8(t).ok().and_then(|s| s.parse().ok()),
        ValueRef::Blob(_) => None,
    };
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("not a decimal: {value:?}").into(),
        )
    })
}

/// Read an optional numeric column; non-finite and unparseable values
/// coerce to `None` rather than erroring.
fn column_opt_f64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f64>> {
    let value = row.get_ref(idx)?;
    Ok(match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) if f.is_finite() => Some(f),
        ValueRef::Real(_) => None,
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| parse_optional_f64(Some(s))),
        ValueRef::Blob(_) => None,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation)
    )
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
