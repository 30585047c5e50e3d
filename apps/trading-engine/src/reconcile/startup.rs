//! Startup reconciliation: one-shot verification of local state against
//! the broker, run before the runtime phases. Any unresolved divergence
//! writes a JSON report and refuses to start.

use std::fs;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;

use crate::broker::Broker;
use crate::store::{ReportRow, StateStore};

use super::{
    apply_safe_order_updates, compare_order_states, compare_positions, ReconcileError,
};

/// Default path of the startup failure report.
pub const STARTUP_REPORT_PATH: &str = "data/reconciliation_error.json";

/// Reconcile local state with the broker at startup.
///
/// Applies safe rule-1 updates, then refuses to start on any remaining
/// discrepancy, writing a JSON report to `report_path`. On a clean pass the
/// current broker positions are snapshotted for the runtime reconciler.
pub async fn reconcile_startup(
    broker: &dyn Broker,
    store: &StateStore,
    report_path: &Path,
) -> Result<(), ReconcileError> {
    let started = Instant::now();

    let broker_orders = broker
        .get_open_orders()
        .await
        .map_err(|e| ReconcileError::Broker(e.to_string()))?;
    let broker_positions = broker
        .get_positions()
        .await
        .map_err(|e| ReconcileError::Broker(e.to_string()))?;
    let local_orders = store.get_all_order_intents(None)?;

    tracing::info!(
        broker_open_orders = broker_orders.len(),
        local_intents = local_orders.len(),
        broker_positions = broker_positions.len(),
        "Startup reconciliation"
    );

    let safe_updates = apply_safe_order_updates(store, &local_orders, &broker_orders)?;
    // Re-read after rule-1 updates so adopted statuses are not re-flagged.
    let local_orders = store.get_all_order_intents(None)?;

    let mut discrepancies = compare_order_states(&local_orders, &broker_orders);
    let local_positions = store
        .latest_positions_snapshot()?
        .into_iter()
        .map(|(symbol, (qty, _))| (symbol, qty))
        .collect();
    discrepancies.extend(compare_positions(&local_positions, &broker_positions));

    let duration_ms = started.elapsed().as_millis() as i64;

    if discrepancies.is_empty() {
        store.snapshot_positions(&broker_positions)?;
        store.insert_reconciliation_report(&ReportRow {
            timestamp_utc: Utc::now().to_rfc3339(),
            check_type: "startup".to_string(),
            duration_ms,
            discrepancies_count: 0,
            repaired_count: safe_updates as i64,
            status: "clean".to_string(),
            discrepancies_json: Some("[]".to_string()),
            repairs_json: None,
            error_message: None,
        })?;
        tracing::info!(
            positions = broker_positions.len(),
            safe_updates,
            "Startup reconciliation clean"
        );
        return Ok(());
    }

    // Divergence: write the report and refuse to start.
    let report = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "check_type": "startup",
        "discrepancies": discrepancies,
        "broker_open_orders": broker_orders.len(),
        "local_intents": local_orders.len(),
        "safe_updates": safe_updates,
    });
    if let Some(parent) = report_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| ReconcileError::Report(e.to_string()))?;
        }
    }
    let payload = serde_json::to_string_pretty(&report)
        .map_err(|e| ReconcileError::Report(e.to_string()))?;
    fs::write(report_path, payload).map_err(|e| ReconcileError::Report(e.to_string()))?;

    store.insert_reconciliation_report(&ReportRow {
        timestamp_utc: Utc::now().to_rfc3339(),
        check_type: "startup".to_string(),
        duration_ms,
        discrepancies_count: discrepancies.len() as i64,
        repaired_count: safe_updates as i64,
        status: "discrepancies_found".to_string(),
        discrepancies_json: serde_json::to_string(&discrepancies).ok(),
        repairs_json: None,
        error_message: None,
    })?;

    tracing::error!(
        count = discrepancies.len(),
        report = %report_path.display(),
        "Startup reconciliation failed; refusing to start"
    );
    Err(ReconcileError::Discrepancies {
        count: discrepancies.len(),
        report_path: report_path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::broker::{BrokerOrder, OrderSide};
    use crate::store::testing::temp_store;
    use crate::store::NewOrderIntent;
    use rust_decimal_macros::dec;

    fn orphan_order(client_id: &str) -> BrokerOrder {
        BrokerOrder {
            id: format!("b-{client_id}"),
            client_order_id: client_id.to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(10),
            status: "accepted".to_string(),
            filled_qty: dec!(0),
            filled_avg_price: None,
            created_at: None,
            fill_id: None,
        }
    }

    #[tokio::test]
    async fn clean_state_snapshots_positions_and_proceeds() {
        let (dir, store) = temp_store();
        let broker = MockBroker::new();
        broker.add_position("AAPL", dec!(10), 100.0);
        // Matching snapshot already recorded.
        store
            .snapshot_positions(&[crate::broker::BrokerPosition {
                symbol: "AAPL".to_string(),
                qty: dec!(10),
                avg_entry_price: 100.0,
                current_price: None,
            }])
            .unwrap();

        let report_path = dir.path().join("reconciliation_error.json");
        reconcile_startup(&broker, &store, &report_path).await.unwrap();

        assert!(!report_path.exists());
        let report = store.latest_reconciliation_report().unwrap().unwrap();
        assert_eq!(report.status, "clean");
        assert_eq!(report.check_type, "startup");
    }

    #[tokio::test]
    async fn orphan_order_refuses_startup_with_report() {
        let (dir, store) = temp_store();
        let broker = MockBroker::new();
        broker
            .open_orders
            .lock()
            .unwrap()
            .push(orphan_order("mystery"));

        let report_path = dir.path().join("reconciliation_error.json");
        let err = reconcile_startup(&broker, &store, &report_path)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Discrepancies { count: 1, .. }));

        // The JSON report names the orphan with the canonical tag.
        let payload = fs::read_to_string(&report_path).unwrap();
        assert!(payload.contains("order_not_in_sqlite"));
        assert!(payload.contains("mystery"));

        let report = store.latest_reconciliation_report().unwrap().unwrap();
        assert_eq!(report.status, "discrepancies_found");
        assert_eq!(report.discrepancies_count, 1);
    }

    #[tokio::test]
    async fn broker_terminal_status_is_adopted_silently() {
        let (dir, store) = temp_store();
        store
            .save_order_intent(&NewOrderIntent {
                client_order_id: "c-1",
                symbol: "AAPL",
                side: OrderSide::Buy,
                qty: dec!(10),
                atr: None,
                status: "submitted",
                strategy: "sma_crossover",
            })
            .unwrap();
        let broker = MockBroker::new();
        let mut order = orphan_order("c-1");
        order.status = "filled".to_string();
        order.filled_qty = dec!(10);
        broker.open_orders.lock().unwrap().push(order);

        let report_path = dir.path().join("reconciliation_error.json");
        reconcile_startup(&broker, &store, &report_path).await.unwrap();

        let row = store.get_order_intent("c-1").unwrap().unwrap();
        assert_eq!(row.status, "filled");
    }

    #[tokio::test]
    async fn unknown_broker_position_refuses() {
        let (dir, store) = temp_store();
        let broker = MockBroker::new();
        broker.add_position("TSLA", dec!(5), 200.0);

        let report_path = dir.path().join("reconciliation_error.json");
        let err = reconcile_startup(&broker, &store, &report_path)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Discrepancies { .. }));
        let payload = fs::read_to_string(&report_path).unwrap();
        assert!(payload.contains("position_not_in_sqlite"));
    }

    #[tokio::test]
    async fn broker_failure_is_not_a_discrepancy() {
        let (dir, store) = temp_store();
        let broker = MockBroker::new();
        broker.push_failure(
            "get_open_orders",
            crate::broker::BrokerError::Transient("down".to_string()),
        );

        let report_path = dir.path().join("reconciliation_error.json");
        let err = reconcile_startup(&broker, &store, &report_path)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Broker(_)));
        assert!(!report_path.exists());
    }
}
