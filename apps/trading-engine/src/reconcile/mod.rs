//! Reconciliation of local state against the broker.
//!
//! The broker is authoritative for terminal order transitions (rule 1,
//! applied silently); everything else that diverges is a discrepancy:
//! local-terminal orders the broker still reports open (rule 2), open
//! broker orders with no local intent (rule 3), and position quantity
//! divergence (rule 4).

pub mod runtime;
pub mod startup;

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::broker::{BrokerOrder, BrokerPosition};
use crate::positions::QTY_MATCH_TOLERANCE;
use crate::store::{OrderIntentRow, StateStore, StoreError};

/// Broker statuses after which an order can never change again.
pub const TERMINAL_STATUSES: &[&str] = &["filled", "canceled", "expired", "rejected"];

/// Broker statuses with remaining fill potential.
pub const NON_TERMINAL_STATUSES: &[&str] = &[
    "new",
    "submitted",
    "accepted",
    "partially_filled",
    "pending_new",
    "pending_cancel",
    "pending_replace",
];

/// Canonical order lifecycle states, folded from broker status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    /// Accepted locally or at the broker, nothing filled yet.
    Pending,
    /// Live at the broker.
    Submitted,
    /// Cancellation requested; fills may still arrive until acknowledged.
    PendingCancel,
    /// Partially filled.
    Partial,
    /// Completely filled (terminal).
    Filled,
    /// Canceled (terminal).
    Cancelled,
    /// Expired (terminal).
    Expired,
    /// Rejected (terminal).
    Rejected,
}

impl OrderState {
    /// Fold a broker status string into a canonical state.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "submitted" | "accepted" => Self::Submitted,
            "partially_filled" => Self::Partial,
            "filled" => Self::Filled,
            "canceled" | "cancelled" => Self::Cancelled,
            "pending_cancel" => Self::PendingCancel,
            "expired" => Self::Expired,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }

    /// Terminal states absorb all later updates.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Expired | Self::Rejected
        )
    }

    /// Whether the order may still receive fills.
    #[must_use]
    pub const fn has_fill_potential(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Submitted | Self::PendingCancel | Self::Partial
        )
    }
}

/// A divergence between local and broker state.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Local terminal, broker still reports non-terminal.
    OrderStatusMismatch {
        /// Client order id.
        client_order_id: String,
        /// Status recorded locally.
        sqlite_status: String,
        /// Status at the broker.
        broker_status: String,
    },
    /// Open order at the broker with no local intent.
    #[serde(rename = "order_not_in_sqlite")]
    OrderNotInStore {
        /// Client order id reported by the broker.
        client_order_id: String,
        /// Symbol.
        symbol: String,
        /// Broker status.
        broker_status: String,
    },
    /// Quantities diverge for a known position.
    PositionMismatch {
        /// Symbol.
        symbol: String,
        /// Signed quantity recorded locally.
        sqlite_qty: f64,
        /// Signed quantity at the broker.
        broker_qty: f64,
    },
    /// The broker holds a position unknown to local state.
    #[serde(rename = "position_not_in_sqlite")]
    PositionNotInStore {
        /// Symbol.
        symbol: String,
        /// Signed quantity at the broker.
        broker_qty: f64,
    },
}

/// A repair applied by the runtime reconciler.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Repair {
    /// Repair kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Symbol repaired.
    pub symbol: String,
    /// Why the state was considered stuck.
    pub reason: String,
    /// Action taken.
    pub action: String,
}

/// Errors from reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Divergence found; startup must refuse.
    #[error("Reconciliation found {count} discrepancies (report: {report_path})")]
    Discrepancies {
        /// Number of discrepancies.
        count: usize,
        /// Where the JSON report was written.
        report_path: String,
    },

    /// Broker state could not be fetched.
    #[error("Failed to fetch state for reconciliation: {0}")]
    Broker(String),

    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The JSON report could not be written.
    #[error("Failed to write reconciliation report: {0}")]
    Report(String),
}

/// Rule 1: the broker is authoritative for terminal transitions. Update
/// local non-terminal intents whose broker status is terminal. Returns the
/// number of rows updated.
pub fn apply_safe_order_updates(
    store: &StateStore,
    local_orders: &[OrderIntentRow],
    broker_orders: &[BrokerOrder],
) -> Result<usize, StoreError> {
    let local_by_id: HashMap<&str, &OrderIntentRow> = local_orders
        .iter()
        .map(|o| (o.client_order_id.as_str(), o))
        .collect();

    let mut updated = 0;
    for order in broker_orders {
        let Some(local) = local_by_id.get(order.client_order_id.as_str()) else {
            continue;
        };
        let broker_terminal = TERMINAL_STATUSES.contains(&order.status.as_str());
        let local_open = NON_TERMINAL_STATUSES.contains(&local.status.as_str());
        if broker_terminal && local_open {
            tracing::info!(
                client_order_id = order.client_order_id,
                from = local.status,
                to = order.status,
                "Adopting broker terminal status"
            );
            store.update_order_intent(
                &order.client_order_id,
                &order.status,
                Some(order.filled_qty),
                Some(&order.id),
                order.filled_avg_price,
            )?;
            updated += 1;
        }
    }
    Ok(updated)
}

/// Rules 2 and 3: order-level discrepancies.
pub fn compare_order_states(
    local_orders: &[OrderIntentRow],
    broker_orders: &[BrokerOrder],
) -> Vec<Discrepancy> {
    let broker_by_id: HashMap<&str, &BrokerOrder> = broker_orders
        .iter()
        .map(|o| (o.client_order_id.as_str(), o))
        .collect();
    let local_ids: std::collections::HashSet<&str> = local_orders
        .iter()
        .map(|o| o.client_order_id.as_str())
        .collect();

    let mut discrepancies = Vec::new();

    // Rule 2: locally terminal, broker disagrees.
    for local in local_orders {
        if !TERMINAL_STATUSES.contains(&local.status.as_str()) {
            continue;
        }
        let Some(broker_order) = broker_by_id.get(local.client_order_id.as_str()) else {
            // Terminal locally and absent from the broker's open orders is
            // the expected end state.
            continue;
        };
        if NON_TERMINAL_STATUSES.contains(&broker_order.status.as_str()) {
            discrepancies.push(Discrepancy::OrderStatusMismatch {
                client_order_id: local.client_order_id.clone(),
                sqlite_status: local.status.clone(),
                broker_status: broker_order.status.clone(),
            });
        }
    }

    // Rule 3: orphaned open orders at the broker.
    for order in broker_orders {
        if !local_ids.contains(order.client_order_id.as_str()) {
            discrepancies.push(Discrepancy::OrderNotInStore {
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                broker_status: order.status.clone(),
            });
        }
    }

    discrepancies
}

/// Rule 4: position-level discrepancies between a local signed-quantity
/// map and the broker's positions.
pub fn compare_positions(
    local_positions: &HashMap<String, Decimal>,
    broker_positions: &[BrokerPosition],
) -> Vec<Discrepancy> {
    let broker_by_symbol: HashMap<&str, Decimal> = broker_positions
        .iter()
        .map(|p| (p.symbol.as_str(), p.qty))
        .collect();

    let mut discrepancies = Vec::new();

    for (symbol, local_qty) in local_positions {
        let broker_qty = broker_by_symbol
            .get(symbol.as_str())
            .copied()
            .unwrap_or(Decimal::ZERO);
        let local = local_qty.to_f64().unwrap_or(0.0);
        let broker = broker_qty.to_f64().unwrap_or(0.0);
        if (local - broker).abs() > QTY_MATCH_TOLERANCE {
            discrepancies.push(Discrepancy::PositionMismatch {
                symbol: symbol.clone(),
                sqlite_qty: local,
                broker_qty: broker,
            });
        }
    }

    for position in broker_positions {
        if !local_positions.contains_key(&position.symbol) && position.qty != Decimal::ZERO {
            discrepancies.push(Discrepancy::PositionNotInStore {
                symbol: position.symbol.clone(),
                broker_qty: position.qty.to_f64().unwrap_or(0.0),
            });
        }
    }

    discrepancies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OrderSide;
    use crate::store::testing::temp_store;
    use crate::store::NewOrderIntent;
    use rust_decimal_macros::dec;

    fn broker_order(client_id: &str, status: &str) -> BrokerOrder {
        BrokerOrder {
            id: format!("b-{client_id}"),
            client_order_id: client_id.to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(10),
            status: status.to_string(),
            filled_qty: dec!(10),
            filled_avg_price: Some(187.0),
            created_at: None,
            fill_id: None,
        }
    }

    fn local_row(client_id: &str, status: &str) -> OrderIntentRow {
        OrderIntentRow {
            client_order_id: client_id.to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(10),
            atr: None,
            status: status.to_string(),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            broker_order_id: Some(format!("b-{client_id}")),
            strategy: "sma_crossover".to_string(),
        }
    }

    #[test]
    fn order_state_folding() {
        assert_eq!(OrderState::from_status("Filled"), OrderState::Filled);
        assert_eq!(OrderState::from_status("accepted"), OrderState::Submitted);
        assert_eq!(
            OrderState::from_status("pending_cancel"),
            OrderState::PendingCancel
        );
        assert_eq!(OrderState::from_status("weird"), OrderState::Pending);
    }

    #[test]
    fn pending_cancel_still_has_fill_potential() {
        let state = OrderState::from_status("pending_cancel");
        assert!(!state.is_terminal());
        assert!(state.has_fill_potential());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for status in TERMINAL_STATUSES {
            let state = OrderState::from_status(status);
            assert!(state.is_terminal(), "{status} should be terminal");
            assert!(!state.has_fill_potential());
        }
    }

    #[test]
    fn rule1_adopts_broker_terminal_status() {
        let (_dir, store) = temp_store();
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

        let local = store.get_all_order_intents(None).unwrap();
        let updated =
            apply_safe_order_updates(&store, &local, &[broker_order("c-1", "filled")]).unwrap();
        assert_eq!(updated, 1);

        let row = store.get_order_intent("c-1").unwrap().unwrap();
        assert_eq!(row.status, "filled");
        assert_eq!(row.filled_qty, dec!(10));
    }

    #[test]
    fn rule1_leaves_matching_states_alone() {
        let (_dir, store) = temp_store();
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
        let local = store.get_all_order_intents(None).unwrap();
        let updated =
            apply_safe_order_updates(&store, &local, &[broker_order("c-1", "accepted")]).unwrap();
        assert_eq!(updated, 0);
    }

    #[test]
    fn rule2_flags_local_terminal_broker_open() {
        let local = vec![local_row("c-1", "filled")];
        let broker = vec![broker_order("c-1", "partially_filled")];
        let discrepancies = compare_order_states(&local, &broker);
        assert_eq!(discrepancies.len(), 1);
        assert!(matches!(
            &discrepancies[0],
            Discrepancy::OrderStatusMismatch { client_order_id, .. } if client_order_id == "c-1"
        ));
    }

    #[test]
    fn rule2_ignores_terminal_order_absent_from_broker() {
        let local = vec![local_row("c-1", "filled")];
        let discrepancies = compare_order_states(&local, &[]);
        assert!(discrepancies.is_empty());
    }

    #[test]
    fn rule3_flags_orphaned_broker_order() {
        let discrepancies = compare_order_states(&[], &[broker_order("mystery", "accepted")]);
        assert_eq!(discrepancies.len(), 1);
        match &discrepancies[0] {
            Discrepancy::OrderNotInStore {
                client_order_id, ..
            } => assert_eq!(client_order_id, "mystery"),
            other => panic!("unexpected discrepancy: {other:?}"),
        }
        // The report serializes with the canonical wire tag.
        let json = serde_json::to_string(&discrepancies[0]).unwrap();
        assert!(json.contains("\"type\":\"order_not_in_sqlite\""));
    }

    #[test]
    fn rule4_flags_qty_mismatch_and_unknown_position() {
        let mut local = HashMap::new();
        local.insert("AAPL".to_string(), dec!(10));
        local.insert("GONE".to_string(), dec!(3));

        let broker = vec![
            BrokerPosition {
                symbol: "AAPL".to_string(),
                qty: dec!(7),
                avg_entry_price: 100.0,
                current_price: None,
            },
            BrokerPosition {
                symbol: "NEW".to_string(),
                qty: dec!(5),
                avg_entry_price: 50.0,
                current_price: None,
            },
        ];

        let discrepancies = compare_positions(&local, &broker);
        assert_eq!(discrepancies.len(), 3);
        assert!(discrepancies.iter().any(|d| matches!(
            d,
            Discrepancy::PositionMismatch { symbol, .. } if symbol == "AAPL"
        )));
        // Local GONE vs broker zero is also a mismatch.
        assert!(discrepancies.iter().any(|d| matches!(
            d,
            Discrepancy::PositionMismatch { symbol, .. } if symbol == "GONE"
        )));
        assert!(discrepancies.iter().any(|d| matches!(
            d,
            Discrepancy::PositionNotInStore { symbol, .. } if symbol == "NEW"
        )));
    }

    #[test]
    fn rule4_matches_within_tolerance() {
        let mut local = HashMap::new();
        local.insert("AAPL".to_string(), dec!(10.00001));
        let broker = vec![BrokerPosition {
            symbol: "AAPL".to_string(),
            qty: dec!(10),
            avg_entry_price: 100.0,
            current_price: None,
        }];
        assert!(compare_positions(&local, &broker).is_empty());
    }
}
