//! Runtime reconciler: continuous truth-repair loop.
//!
//! Every interval it re-applies the four reconciliation rules, clears
//! stuck `pending_exit` flags, halts trading on discrepancies, and clears
//! the halt on the next clean pass. Repeated broker failures degrade the
//! loop to warning-only until a call succeeds again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;

use crate::broker::{Broker, BrokerOrder, BrokerPosition, OrderSide};
use crate::config::ReconcilerConfig;
use crate::positions::{PositionSide, PositionTracker};
use crate::store::{ReportRow, StateStore, StoreError};

use super::{
    apply_safe_order_updates, compare_order_states, compare_positions, Discrepancy, OrderState,
    Repair,
};

/// Interval bounds for the runtime loop.
const MIN_INTERVAL_SECS: u64 = 30;
const MAX_INTERVAL_SECS: u64 = 300;

/// Consecutive broker failures before degrading to warning-only mode.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Outcome of one runtime check.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeCheck {
    /// Outcome status.
    pub status: String,
    /// Discrepancies found this pass.
    pub discrepancies: Vec<Discrepancy>,
    /// Repairs applied this pass.
    pub repairs: Vec<Repair>,
    /// Rule-1 updates applied this pass.
    pub safe_updates: usize,
}

/// Periodic reconciliation of local state against broker truth.
pub struct RuntimeReconciler {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
    tracker: Arc<PositionTracker>,
    interval: Duration,
    repair_stuck_exits: bool,
    halt_on_discrepancy: bool,
    broker_timeout: Duration,
    consecutive_failures: AtomicU32,
}

impl RuntimeReconciler {
    /// Create a reconciler; the interval is clamped to 30-300 seconds.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<StateStore>,
        tracker: Arc<PositionTracker>,
        config: &ReconcilerConfig,
    ) -> Self {
        let interval = config
            .check_interval_seconds
            .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        Self {
            broker,
            store,
            tracker,
            interval: Duration::from_secs(interval),
            repair_stuck_exits: config.repair_stuck_exits,
            halt_on_discrepancy: config.halt_on_discrepancy,
            broker_timeout: Duration::from_secs(config.broker_timeout_seconds.max(1)),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Current consecutive broker-failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Run a single reconciliation check and persist its report.
    pub async fn run_check(&self) -> Result<RuntimeCheck, StoreError> {
        let started = Instant::now();

        let Some((broker_orders, broker_positions)) = self.fetch_broker_state().await else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= MAX_CONSECUTIVE_FAILURES {
                self.store.set_state("broker_health", "degraded")?;
                tracing::warn!(
                    failures,
                    "Runtime reconciler degraded to warning-only mode"
                );
            } else {
                tracing::warn!(failures, "Runtime reconciliation: broker unavailable");
            }
            let check = RuntimeCheck {
                status: "broker_unavailable".to_string(),
                discrepancies: Vec::new(),
                repairs: Vec::new(),
                safe_updates: 0,
            };
            self.persist(&check, started, Some("Broker API unavailable or timed out"))?;
            return Ok(check);
        };

        // Success resets the failure counter and the health flag.
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.store.set_state("broker_health", "healthy")?;

        let local_orders = self.store.get_all_order_intents(None)?;
        let safe_updates = apply_safe_order_updates(&self.store, &local_orders, &broker_orders)?;
        let local_orders = self.store.get_all_order_intents(None)?;

        let mut discrepancies = compare_order_states(&local_orders, &broker_orders);
        let local_positions: HashMap<String, Decimal> = self
            .store
            .latest_positions_snapshot()?
            .into_iter()
            .map(|(symbol, (qty, _))| (symbol, qty))
            .collect();
        discrepancies.extend(compare_positions(&local_positions, &broker_positions));

        let mut repairs = Vec::new();
        if self.repair_stuck_exits {
            for (symbol, reason) in
                self.find_stuck_pending_exits(&broker_orders, &broker_positions)?
            {
                self.repair_stuck_exit(&symbol)?;
                repairs.push(Repair {
                    kind: "stuck_pending_exit".to_string(),
                    symbol,
                    reason,
                    action: "cleared_pending_exit_flag".to_string(),
                });
            }
        }

        if discrepancies.is_empty() {
            // Clean pass: refresh the snapshot so later comparisons track
            // the live book, and lift any earlier halt.
            self.store.snapshot_positions(&broker_positions)?;
            if self.store.get_state("trading_halted")?.as_deref() == Some("true") {
                self.store.set_state("trading_halted", "false")?;
                tracing::info!("Runtime reconciliation clean; trading halt cleared");
            }
        } else if self.halt_on_discrepancy {
            self.store.set_state("trading_halted", "true")?;
            tracing::error!(
                count = discrepancies.len(),
                "Runtime reconciliation found discrepancies; trading halted"
            );
        }

        let check = RuntimeCheck {
            status: if discrepancies.is_empty() {
                "clean".to_string()
            } else {
                "discrepancies_found".to_string()
            },
            discrepancies,
            repairs,
            safe_updates,
        };

        if check.discrepancies.is_empty() && check.repairs.is_empty() {
            tracing::debug!(safe_updates, "Runtime reconciliation clean");
        } else {
            tracing::warn!(
                discrepancies = check.discrepancies.len(),
                repairs = check.repairs.len(),
                safe_updates,
                "Runtime reconciliation applied changes"
            );
        }

        self.persist(&check, started, None)?;
        Ok(check)
    }

    async fn fetch_broker_state(&self) -> Option<(Vec<BrokerOrder>, Vec<BrokerPosition>)> {
        let orders = tokio::time::timeout(self.broker_timeout, self.broker.get_open_orders())
            .await
            .ok()?
            .ok()?;
        let positions = tokio::time::timeout(self.broker_timeout, self.broker.get_positions())
            .await
            .ok()?
            .ok()?;
        Some((orders, positions))
    }

    /// A `pending_exit` flag is stuck when the position is gone at the
    /// broker, or no working exit order exists locally or at the broker.
    fn find_stuck_pending_exits(
        &self,
        broker_orders: &[BrokerOrder],
        broker_positions: &[BrokerPosition],
    ) -> Result<Vec<(String, String)>, StoreError> {
        let pending = self.store.pending_exit_positions()?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let position_symbols: std::collections::HashSet<&str> =
            broker_positions.iter().map(|p| p.symbol.as_str()).collect();
        let mut orders_by_symbol: HashMap<&str, Vec<&BrokerOrder>> = HashMap::new();
        for order in broker_orders {
            orders_by_symbol
                .entry(order.symbol.as_str())
                .or_default()
                .push(order);
        }

        let mut stuck = Vec::new();
        for (symbol, side) in pending {
            if !position_symbols.contains(symbol.as_str()) {
                stuck.push((symbol, "position_closed_but_flag_set".to_string()));
                continue;
            }

            if self.store.has_working_exit_order(&symbol, side)? {
                continue;
            }

            let exit_side = match side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            };
            let has_broker_exit = orders_by_symbol
                .get(symbol.as_str())
                .is_some_and(|orders| {
                    orders.iter().any(|order| {
                        order.side == exit_side
                            && OrderState::from_status(&order.status).has_fill_potential()
                    })
                });
            if !has_broker_exit {
                stuck.push((symbol, "no_working_exit_order".to_string()));
            }
        }
        Ok(stuck)
    }

    fn repair_stuck_exit(&self, symbol: &str) -> Result<(), StoreError> {
        self.store.clear_pending_exit(symbol)?;
        self.tracker.set_pending_exit(symbol, false)?;
        tracing::warn!(symbol, "Repaired stuck pending_exit");
        Ok(())
    }

    fn persist(
        &self,
        check: &RuntimeCheck,
        started: Instant,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store.insert_reconciliation_report(&ReportRow {
            timestamp_utc: now.to_rfc3339(),
            check_type: "runtime".to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
            discrepancies_count: check.discrepancies.len() as i64,
            repaired_count: check.repairs.len() as i64,
            status: check.status.clone(),
            discrepancies_json: serde_json::to_string(&check.discrepancies).ok(),
            repairs_json: serde_json::to_string(&check.repairs).ok(),
            error_message: error_message.map(str::to_string),
        })?;
        self.store
            .set_state("reconciler_last_check_utc", &now.to_rfc3339())?;
        self.store.set_state(
            "reconciler_consecutive_failures",
            &self.consecutive_failures().to_string(),
        )?;
        Ok(())
    }

    /// Reconciliation loop.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            repair_stuck_exits = self.repair_stuck_exits,
            halt_on_discrepancy = self.halt_on_discrepancy,
            "Runtime reconciler started"
        );
        loop {
            if let Err(err) = self.run_check().await {
                tracing::error!(error = %err, "Runtime reconciliation check failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
