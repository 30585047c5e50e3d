//! Deterministic, idempotent, additive-only schema migration.
//!
//! Owns all DDL for the engine database. Runs once at startup BEFORE the
//! state store or any other consumer opens the database. Creates missing
//! tables, adds missing columns, creates missing indexes -- and never
//! drops, renames, or modifies an existing structure.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::Connection;
use thiserror::Error;

/// Bump when adding tables, columns, or indexes.
pub const CURRENT_SCHEMA_VERSION: i64 = 4;

/// Canonical table definitions (CREATE TABLE IF NOT EXISTS).
const TABLES: &[(&str, &str)] = &[
    (
        "schema_meta",
        "CREATE TABLE IF NOT EXISTS schema_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
    ),
    (
        "order_intents",
        "CREATE TABLE IF NOT EXISTS order_intents (
            client_order_id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            qty NUMERIC(10, 4) NOT NULL,
            atr NUMERIC(10, 4),
            status TEXT NOT NULL,
            filled_qty NUMERIC(10, 4) DEFAULT 0,
            filled_avg_price NUMERIC(10, 4),
            broker_order_id TEXT,
            created_at_utc TEXT NOT NULL,
            updated_at_utc TEXT NOT NULL,
            strategy TEXT DEFAULT ''
        )",
    ),
    (
        "trades",
        "CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_utc TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            qty NUMERIC(10, 4) NOT NULL,
            price NUMERIC(10, 4) NOT NULL,
            order_id TEXT NOT NULL,
            client_order_id TEXT NOT NULL,
            fill_id TEXT,
            UNIQUE (order_id, fill_id),
            UNIQUE (order_id, client_order_id)
        )",
    ),
    (
        "fills",
        "CREATE TABLE IF NOT EXISTS fills (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker_order_id TEXT NOT NULL,
            client_order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            delta_qty NUMERIC(10, 4) NOT NULL,
            cum_qty NUMERIC(10, 4) NOT NULL,
            cum_avg_price NUMERIC(10, 4),
            timestamp_utc TEXT NOT NULL,
            fill_id TEXT,
            price_is_estimate INTEGER NOT NULL DEFAULT 1,
            fill_dedupe_key TEXT NOT NULL,
            UNIQUE(broker_order_id, fill_dedupe_key)
        )",
    ),
    (
        "equity_curve",
        "CREATE TABLE IF NOT EXISTS equity_curve (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_utc TEXT NOT NULL,
            equity NUMERIC(12, 2) NOT NULL,
            daily_pnl NUMERIC(12, 2) NOT NULL
        )",
    ),
    (
        "bot_state",
        "CREATE TABLE IF NOT EXISTS bot_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at_utc TEXT NOT NULL
        )",
    ),
    (
        "bars",
        "CREATE TABLE IF NOT EXISTS bars (
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            timestamp_utc TEXT NOT NULL,
            open NUMERIC(10, 4),
            high NUMERIC(10, 4),
            low NUMERIC(10, 4),
            close NUMERIC(10, 4),
            volume INTEGER,
            trade_count INTEGER,
            vwap NUMERIC(10, 4),
            PRIMARY KEY (symbol, timeframe, timestamp_utc)
        )",
    ),
    (
        "positions_snapshot",
        "CREATE TABLE IF NOT EXISTS positions_snapshot (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_utc TEXT NOT NULL,
            symbol TEXT NOT NULL,
            qty NUMERIC(10, 4) NOT NULL,
            avg_entry_price NUMERIC(10, 4) NOT NULL
        )",
    ),
    (
        "signal_gates",
        "CREATE TABLE IF NOT EXISTS signal_gates (
            strategy TEXT NOT NULL,
            symbol TEXT NOT NULL,
            action TEXT NOT NULL,
            last_accepted_ts_utc TEXT NOT NULL,
            last_bar_ts_utc TEXT,
            PRIMARY KEY (strategy, symbol, action)
        )",
    ),
    (
        "position_tracking",
        "CREATE TABLE IF NOT EXISTS position_tracking (
            symbol TEXT PRIMARY KEY,
            side TEXT NOT NULL,
            qty NUMERIC(10, 4) NOT NULL,
            entry_price NUMERIC(10, 4) NOT NULL,
            atr NUMERIC(10, 4),
            entry_time TEXT NOT NULL,
            extreme_price NUMERIC(10, 4) NOT NULL,
            trailing_stop_price NUMERIC(10, 4),
            trailing_stop_activated INTEGER DEFAULT 0,
            pending_exit INTEGER DEFAULT 0,
            updated_at TEXT NOT NULL
        )",
    ),
    (
        "exit_attempts",
        "CREATE TABLE IF NOT EXISTS exit_attempts (
            symbol TEXT PRIMARY KEY,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_ts_utc TEXT NOT NULL,
            reason TEXT
        )",
    ),
    (
        "reconciliation_reports",
        "CREATE TABLE IF NOT EXISTS reconciliation_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_utc TEXT NOT NULL,
            check_type TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            discrepancies_count INTEGER NOT NULL DEFAULT 0,
            repaired_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            discrepancies_json TEXT,
            repairs_json TEXT,
            error_message TEXT
        )",
    ),
];

/// Columns added to older databases in place.
///
/// Each definition MUST be safe for ALTER TABLE ADD COLUMN: plain
/// text/integer/real/numeric with at most DEFAULT, and NOT NULL only
/// alongside DEFAULT. No keys, uniqueness, checks, or references.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("fills", "delta_fill_price", "NUMERIC(10, 4)"),
    ("order_intents", "atr", "NUMERIC(10, 4)"),
    ("order_intents", "filled_avg_price", "NUMERIC(10, 4)"),
    ("order_intents", "strategy", "TEXT DEFAULT ''"),
];

const INDEXES: &[(&str, &str)] = &[
    (
        "idx_bars_symbol_timestamp",
        "CREATE INDEX IF NOT EXISTS idx_bars_symbol_timestamp ON bars(symbol, timestamp_utc)",
    ),
    (
        "idx_equity_curve_timestamp",
        "CREATE INDEX IF NOT EXISTS idx_equity_curve_timestamp ON equity_curve(timestamp_utc)",
    ),
    (
        "idx_fills_broker_order_id",
        "CREATE INDEX IF NOT EXISTS idx_fills_broker_order_id ON fills(broker_order_id)",
    ),
    (
        "idx_fills_client_order_id",
        "CREATE INDEX IF NOT EXISTS idx_fills_client_order_id ON fills(client_order_id)",
    ),
    (
        "idx_fills_symbol",
        "CREATE INDEX IF NOT EXISTS idx_fills_symbol ON fills(symbol)",
    ),
    (
        "idx_fills_timestamp",
        "CREATE INDEX IF NOT EXISTS idx_fills_timestamp ON fills(timestamp_utc)",
    ),
    (
        "idx_order_intents_broker_order_id",
        "CREATE INDEX IF NOT EXISTS idx_order_intents_broker_order_id \
         ON order_intents(broker_order_id)",
    ),
    (
        "idx_order_intents_status",
        "CREATE INDEX IF NOT EXISTS idx_order_intents_status ON order_intents(status)",
    ),
    (
        "idx_order_intents_strategy_symbol_side_status",
        "CREATE INDEX IF NOT EXISTS idx_order_intents_strategy_symbol_side_status \
         ON order_intents(strategy, symbol, side, status)",
    ),
    (
        "idx_order_intents_symbol",
        "CREATE INDEX IF NOT EXISTS idx_order_intents_symbol ON order_intents(symbol)",
    ),
    (
        "idx_position_tracking_pending_exit",
        "CREATE INDEX IF NOT EXISTS idx_position_tracking_pending_exit \
         ON position_tracking(pending_exit)",
    ),
    (
        "idx_positions_snapshot_timestamp",
        "CREATE INDEX IF NOT EXISTS idx_positions_snapshot_timestamp \
         ON positions_snapshot(timestamp_utc)",
    ),
    (
        "idx_reconciliation_reports_status",
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_reports_status \
         ON reconciliation_reports(status)",
    ),
    (
        "idx_reconciliation_reports_timestamp",
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_reports_timestamp \
         ON reconciliation_reports(timestamp_utc)",
    ),
    (
        "idx_signal_gates_symbol",
        "CREATE INDEX IF NOT EXISTS idx_signal_gates_symbol ON signal_gates(symbol)",
    ),
    (
        "idx_trades_symbol_timestamp",
        "CREATE INDEX IF NOT EXISTS idx_trades_symbol_timestamp ON trades(symbol, timestamp_utc)",
    ),
];

/// Tokens that make a column definition unsafe for ALTER TABLE ADD COLUMN.
const UNSAFE_TOKENS: &[&str] = &[
    "PRIMARY KEY",
    "UNIQUE",
    "CHECK",
    "FOREIGN KEY",
    "REFERENCES",
    "AUTOINCREMENT",
];

/// Raised when schema migration fails; the caller must abort startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The database was written by a newer build.
    #[error(
        "Database schema version ({db_version}) is newer than code version ({code_version}). \
         Upgrade the application or restore from backup."
    )]
    NewerThanCode {
        /// Version stored in the database.
        db_version: i64,
        /// Version this build understands.
        code_version: i64,
    },

    /// An additive column definition is not safe for in-place addition.
    #[error("Unsafe column definition for {table}.{column}: {definition}")]
    UnsafeColumn {
        /// Target table.
        table: String,
        /// Target column.
        column: String,
        /// Offending definition.
        definition: String,
    },

    /// An existing table diverges in a way ALTER TABLE cannot fix.
    #[error("Non-additive schema drift: {0}")]
    NonAdditiveDrift(String),

    /// The pre-commit backup could not be produced.
    #[error("Schema backup failed: {0}")]
    BackupFailed(String),

    /// Any other migration failure.
    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl From<rusqlite::Error> for SchemaError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Migration(err.to_string())
    }
}

/// True when `definition` is safe to add via ALTER TABLE ADD COLUMN.
#[must_use]
pub fn is_safe_column_def(definition: &str) -> bool {
    let upper = definition.to_uppercase();
    if UNSAFE_TOKENS.iter().any(|t| upper.contains(t)) {
        return false;
    }
    // NOT NULL without DEFAULT would fail against existing rows.
    if upper.contains("NOT NULL") && !upper.contains("DEFAULT") {
        return false;
    }
    true
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn existing_names(conn: &Connection, kind: &str) -> Result<Vec<String>, SchemaError> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = ?1")?;
    let names = stmt
        .query_map([kind], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, SchemaError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Column sets of every unique index on `table`.
fn unique_index_column_sets(
    conn: &Connection,
    table: &str,
) -> Result<Vec<Vec<String>>, SchemaError> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(table)))?;
    let index_names = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let unique: i64 = row.get(2)?;
            Ok((name, unique != 0))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut sets = Vec::new();
    for (name, unique) in index_names {
        if !unique {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&name)))?;
        let mut columns = info
            .query_map([], |row| row.get::<_, String>(2))?
            .collect::<Result<Vec<_>, _>>()?;
        columns.sort();
        sets.push(columns);
    }
    Ok(sets)
}

/// Write a consistent snapshot backup next to the database.
///
/// Uses the engine backup API through a fresh read connection, never a raw
/// file copy, so the snapshot is consistent under WAL.
fn backup_database(db_path: &Path) -> Result<(), SchemaError> {
    let parent = db_path
        .parent()
        .ok_or_else(|| SchemaError::BackupFailed("database path has no parent".to_string()))?;
    let backup_dir = parent.join("db_backups");
    fs::create_dir_all(&backup_dir)
        .map_err(|e| SchemaError::BackupFailed(format!("create {}: {e}", backup_dir.display())))?;

    let stem = db_path
        .file_stem()
        .map_or_else(|| "database".to_string(), |s| s.to_string_lossy().to_string());
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = backup_dir.join(format!("{stem}.{timestamp}.bak"));

    let src = Connection::open(db_path)?;
    let mut dst = Connection::open(&backup_path)?;
    {
        let backup = Backup::new(&src, &mut dst)?;
        backup
            .run_to_completion(64, Duration::from_millis(5), None)
            .map_err(|e| SchemaError::BackupFailed(e.to_string()))?;
    }

    let size = fs::metadata(&backup_path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(SchemaError::BackupFailed(format!(
            "{} missing or empty",
            backup_path.display()
        )));
    }
    tracing::info!(path = %backup_path.display(), "Schema backup created");
    Ok(())
}

/// Ensure the database schema is up to date.
///
/// Creates missing tables, adds missing columns, creates missing indexes,
/// and records the schema version -- all inside one transaction with an
/// early write lock. Returns human-readable descriptions of the changes
/// made (or planned, in dry-run mode).
pub fn ensure_schema(db_path: &Path, dry_run: bool) -> Result<Vec<String>, SchemaError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| SchemaError::Migration(e.to_string()))?;
        }
    }

    let db_existed = fs::metadata(db_path).map(|m| m.len() > 0).unwrap_or(false);
    let conn = Connection::open(db_path)?;

    // PRAGMAs live outside the transaction. Dry-run skips the journal-mode
    // change and the write lock so it has no side effects.
    conn.busy_timeout(Duration::from_secs(5))?;
    if dry_run {
        conn.execute_batch("BEGIN")?;
    } else {
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
    }

    match apply_schema(&conn) {
        Ok(actions) => {
            if dry_run {
                conn.execute_batch("ROLLBACK")?;
                if actions.is_empty() {
                    tracing::info!("Schema dry-run: schema up to date");
                } else {
                    tracing::info!(planned = actions.len(), "Schema dry-run: changes planned");
                }
            } else {
                if db_existed && !actions.is_empty() {
                    if let Err(e) = backup_database(db_path) {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(e);
                    }
                }
                conn.execute_batch("COMMIT")?;
                if actions.is_empty() {
                    tracing::info!(version = CURRENT_SCHEMA_VERSION, "Schema up to date");
                } else {
                    tracing::info!(changes = actions.len(), "Schema updated");
                }
            }
            Ok(actions)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

fn apply_schema(conn: &Connection) -> Result<Vec<String>, SchemaError> {
    let mut actions: Vec<String> = Vec::new();

    let mut existing_tables = existing_names(conn, "table")?;
    let trades_pre_existing = existing_tables.iter().any(|t| t == "trades");

    if !existing_tables.iter().any(|t| t == "schema_meta") {
        // Not reported as a user-visible change.
        conn.execute_batch(TABLES[0].1)?;
        existing_tables.push("schema_meta".to_string());
    }

    let stored_version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM schema_meta WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(version) = stored_version {
        if version > CURRENT_SCHEMA_VERSION {
            return Err(SchemaError::NewerThanCode {
                db_version: version,
                code_version: CURRENT_SCHEMA_VERSION,
            });
        }
    }

    // Missing tables, in name order.
    let mut table_defs: Vec<&(&str, &str)> = TABLES.iter().collect();
    table_defs.sort_by_key(|(name, _)| *name);
    for (name, ddl) in table_defs {
        if *name == "schema_meta" {
            continue;
        }
        if !existing_tables.iter().any(|t| t == name) {
            conn.execute_batch(ddl)?;
            let action = format!("Created table {name}");
            tracing::info!("{action}");
            actions.push(action);
        }
    }

    // Missing columns, deterministically ordered.
    let mut columns: Vec<&(&str, &str, &str)> = ADDITIVE_COLUMNS.iter().collect();
    columns.sort_by_key(|(table, column, _)| (*table, *column));
    for (table, column, definition) in columns {
        if !is_safe_column_def(definition) {
            return Err(SchemaError::UnsafeColumn {
                table: (*table).to_string(),
                column: (*column).to_string(),
                definition: (*definition).to_string(),
            });
        }
        let existing = table_columns(conn, table)?;
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {definition}",
                quote_ident(table),
                quote_ident(column),
            ))?;
            let action = format!("Added column {table}.{column}");
            tracing::info!("{action}");
            actions.push(action);
        }
    }

    // Missing indexes, in name order.
    let existing_indexes = existing_names(conn, "index")?;
    let mut index_defs: Vec<&(&str, &str)> = INDEXES.iter().collect();
    index_defs.sort_by_key(|(name, _)| *name);
    for (name, ddl) in index_defs {
        if !existing_indexes.iter().any(|i| i == name) {
            conn.execute_batch(ddl)?;
            let action = format!("Created index {name}");
            tracing::info!("{action}");
            actions.push(action);
        }
    }

    // The trades uniqueness contract cannot be added via ALTER TABLE. If a
    // pre-existing table lacks it, refuse rather than silently rebuild.
    if trades_pre_existing {
        let trades_cols = table_columns(conn, "trades")?;
        if !trades_cols.iter().any(|c| c == "fill_id") {
            return Err(SchemaError::NonAdditiveDrift(
                "trades table exists but lacks the fill_id column and required UNIQUE \
                 constraints; a manual table rebuild is required"
                    .to_string(),
            ));
        }
        let unique_sets = unique_index_column_sets(conn, "trades")?;
        let required: [&[&str]; 2] = [&["fill_id", "order_id"], &["client_order_id", "order_id"]];
        for pair in required {
            let satisfied = unique_sets
                .iter()
                .any(|set| set.iter().map(String::as_str).eq(pair.iter().copied()));
            if !satisfied {
                return Err(SchemaError::NonAdditiveDrift(
                    "trades table exists but lacks required UNIQUE constraints on \
                     (order_id, fill_id) and/or (order_id, client_order_id); a manual \
                     table rebuild is required"
                        .to_string(),
                ));
            }
        }
    }

    // Record the schema version.
    let now = Utc::now().to_rfc3339();
    match stored_version {
        None => {
            conn.execute(
                "INSERT INTO schema_meta (id, schema_version, updated_at) VALUES (1, ?1, ?2)",
                rusqlite::params![CURRENT_SCHEMA_VERSION, now],
            )?;
            let action = format!("Set schema version to {CURRENT_SCHEMA_VERSION}");
            tracing::info!("{action}");
            actions.push(action);
        }
        Some(version) if version < CURRENT_SCHEMA_VERSION => {
            conn.execute(
                "UPDATE schema_meta SET schema_version = ?1, updated_at = ?2 WHERE id = 1",
                rusqlite::params![CURRENT_SCHEMA_VERSION, now],
            )?;
            let action = format!("Schema upgraded from v{version} to v{CURRENT_SCHEMA_VERSION}");
            tracing::info!("{action}");
            actions.push(action);
        }
        Some(_) => {}
    }

    Ok(actions)
}
