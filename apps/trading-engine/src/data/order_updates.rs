//! Order-update polling: fetches the broker's authoritative view of every
//! open order intent, computes cumulative-fill deltas, records fills
//! idempotently, and publishes order-update events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::broker::Broker;
use crate::events::{BusError, Event, EventBus, OrderUpdateEvent};
use crate::store::{FillRecord, StateStore};

/// Seconds between polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls per-order status and emits delta fills.
pub struct OrderUpdatePoller {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
}

impl OrderUpdatePoller {
    /// Create a poller.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, store: Arc<StateStore>, bus: Arc<EventBus>) -> Self {
        Self { broker, store, bus }
    }

    /// One pass over every open order intent with a broker id.
    ///
    /// Per-order failures are logged and skipped; only a closed bus stops
    /// the pass.
    pub async fn poll_once(&self) -> Result<(), BusError> {
        let intents = match self.store.get_pollable_order_intents() {
            Ok(intents) => intents,
            Err(err) => {
                tracing::error!(error = %err, "Failed to load pollable order intents");
                return Ok(());
            }
        };

        for intent in intents {
            let Some(broker_order_id) = intent.broker_order_id.clone() else {
                continue;
            };
            let order = match self.broker.get_order(&broker_order_id).await {
                Ok(order) => order,
                Err(err) => {
                    tracing::warn!(
                        client_order_id = intent.client_order_id,
                        error = %err,
                        "Failed to check order"
                    );
                    continue;
                }
            };

            let prev_cum = intent.filled_qty;
            let new_cum = order.filled_qty;
            let delta = new_cum - prev_cum;

            if delta < Decimal::ZERO {
                // The broker can never un-fill; never decrement local state.
                tracing::warn!(
                    client_order_id = intent.client_order_id,
                    %prev_cum,
                    %new_cum,
                    "Ignoring cumulative-fill regression"
                );
                continue;
            }

            if delta == Decimal::ZERO {
                if order.status != intent.status {
                    tracing::info!(
                        client_order_id = intent.client_order_id,
                        from = intent.status,
                        to = order.status,
                        "Order status changed"
                    );
                    if let Err(err) = self.store.update_order_intent(
                        &intent.client_order_id,
                        &order.status,
                        None,
                        None,
                        order.filled_avg_price,
                    ) {
                        tracing::error!(
                            client_order_id = intent.client_order_id,
                            error = %err,
                            "Failed to persist status change"
                        );
                    }
                }
                continue;
            }

            // New fill quantity observed.
            let now = Utc::now();
            let fill = FillRecord {
                broker_order_id: broker_order_id.clone(),
                client_order_id: intent.client_order_id.clone(),
                symbol: intent.symbol.clone(),
                side: intent.side,
                delta_qty: delta,
                cum_qty: new_cum,
                cum_avg_price: order.filled_avg_price,
                timestamp: now,
                fill_id: order.fill_id.clone(),
                price_is_estimate: order.filled_avg_price.is_none(),
            };

            let inserted = match self.store.insert_fill_idempotent(&fill) {
                Ok(inserted) => inserted,
                Err(err) => {
                    tracing::error!(
                        client_order_id = intent.client_order_id,
                        error = %err,
                        "Failed to record fill"
                    );
                    continue;
                }
            };

            if let Err(err) = self.store.update_order_intent_cumulative(
                &broker_order_id,
                &order.status,
                new_cum,
                order.filled_avg_price,
                now,
            ) {
                tracing::error!(
                    client_order_id = intent.client_order_id,
                    error = %err,
                    "Failed to persist cumulative fill"
                );
            }

            // A dedupe conflict means this fill was already recorded in an
            // earlier life; publish a zero-delta update so consumers converge.
            let event_delta = if inserted { delta } else { Decimal::ZERO };
            if inserted {
                tracing::info!(
                    client_order_id = intent.client_order_id,
                    symbol = intent.symbol,
                    %delta,
                    %new_cum,
                    status = order.status,
                    "Fill delta recorded"
                );
            }
            self.bus
                .publish(Event::OrderUpdate(OrderUpdateEvent {
                    broker_order_id: broker_order_id.clone(),
                    client_order_id: intent.client_order_id.clone(),
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    status: order.status.clone(),
                    cum_filled_qty: new_cum,
                    cum_avg_price: order.filled_avg_price,
                    delta_qty: event_delta,
                    timestamp: now,
                    fill_id: order.fill_id.clone(),
                }))
                .await?;
        }
        Ok(())
    }

    /// Poll loop on a fixed interval; stops when the bus closes.
    pub async fn run(self: Arc<Self>) {
        tracing::info!("Order update polling started");
        loop {
            if let Err(BusError::Closed) = self.poll_once().await {
                tracing::info!("Event bus closed; order update polling stopped");
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::broker::{BrokerOrder, OrderSide};
    use crate::store::testing::temp_store;
    use crate::store::NewOrderIntent;
    use rust_decimal_macros::dec;

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: Arc<MockBroker>,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        poller: OrderUpdatePoller,
    }

    fn fixture() -> Fixture {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let broker = Arc::new(MockBroker::new());
        let bus = Arc::new(EventBus::with_defaults());
        bus.start();
        let poller = OrderUpdatePoller::new(broker.clone(), store.clone(), bus.clone());
        Fixture {
            _dir: dir,
            broker,
            store,
            bus,
            poller,
        }
    }

    fn seed_intent(fx: &Fixture, client_id: &str, broker_id: &str, filled: Decimal) {
        fx.store
            .save_order_intent(&NewOrderIntent {
                client_order_id: client_id,
                symbol: "AAPL",
                side: OrderSide::Buy,
                qty: dec!(30),
                atr: None,
                status: "new",
                strategy: "sma_crossover",
            })
            .unwrap();
        fx.store
            .update_order_intent(client_id, "submitted", Some(filled), Some(broker_id), None)
            .unwrap();
    }

    fn broker_view(fx: &Fixture, broker_id: &str, status: &str, cum: Decimal, price: Option<f64>) {
        fx.broker.orders_by_id.lock().unwrap().insert(
            broker_id.to_string(),
            BrokerOrder {
                id: broker_id.to_string(),
                client_order_id: "c-1".to_string(),
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                qty: dec!(30),
                status: status.to_string(),
                filled_qty: cum,
                filled_avg_price: price,
                created_at: None,
                fill_id: None,
            },
        );
    }

    #[tokio::test]
    async fn partial_fill_produces_delta_event() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(10));
        broker_view(&fx, "broker-1", "partially_filled", dec!(25), Some(187.0));

        fx.poller.poll_once().await.unwrap();

        // One fill row, delta 15, cum 25.
        assert_eq!(fx.store.fill_count("broker-1").unwrap(), 1);
        let intent = fx.store.get_order_intent("c-1").unwrap().unwrap();
        assert_eq!(intent.filled_qty, dec!(25));
        assert_eq!(intent.status, "partially_filled");

        match fx.bus.recv().await.unwrap() {
            Event::OrderUpdate(update) => {
                assert_eq!(update.delta_qty, dec!(15));
                assert_eq!(update.cum_filled_qty, dec!(25));
                assert_eq!(update.status, "partially_filled");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_order_is_silent() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(10));
        broker_view(&fx, "broker-1", "submitted", dec!(10), None);

        fx.poller.poll_once().await.unwrap();

        assert_eq!(fx.store.fill_count("broker-1").unwrap(), 0);
        assert_eq!(fx.bus.size(), 0);
    }

    #[tokio::test]
    async fn status_only_change_updates_intent_without_event() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(10));
        broker_view(&fx, "broker-1", "canceled", dec!(10), None);

        fx.poller.poll_once().await.unwrap();

        let intent = fx.store.get_order_intent("c-1").unwrap().unwrap();
        assert_eq!(intent.status, "canceled");
        // Filled qty is preserved across the terminal transition.
        assert_eq!(intent.filled_qty, dec!(10));
        assert_eq!(fx.bus.size(), 0);
    }

    #[tokio::test]
    async fn regression_is_ignored() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(25));
        broker_view(&fx, "broker-1", "partially_filled", dec!(10), None);

        fx.poller.poll_once().await.unwrap();

        let intent = fx.store.get_order_intent("c-1").unwrap().unwrap();
        assert_eq!(intent.filled_qty, dec!(25));
        assert_eq!(fx.store.fill_count("broker-1").unwrap(), 0);
        assert_eq!(fx.bus.size(), 0);
    }

    #[tokio::test]
    async fn dedupe_conflict_publishes_zero_delta() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(10));
        broker_view(&fx, "broker-1", "partially_filled", dec!(25), Some(187.0));

        fx.poller.poll_once().await.unwrap();
        let _first = fx.bus.recv().await.unwrap();

        // Simulate a restart that lost the intent update but kept the fill
        // row: the same cumulative quantity arrives again.
        fx.store
            .update_order_intent("c-1", "submitted", Some(dec!(10)), None, None)
            .unwrap();

        fx.poller.poll_once().await.unwrap();
        // No second fill row for the same dedupe key.
        assert_eq!(fx.store.fill_count("broker-1").unwrap(), 1);
        match fx.bus.recv().await.unwrap() {
            Event::OrderUpdate(update) => {
                assert_eq!(update.delta_qty, Decimal::ZERO);
                assert_eq!(update.cum_filled_qty, dec!(25));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // And the intent has converged back to the broker's view.
        let intent = fx.store.get_order_intent("c-1").unwrap().unwrap();
        assert_eq!(intent.filled_qty, dec!(25));
    }

    #[tokio::test]
    async fn broker_error_skips_order() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(10));
        fx.broker.push_failure(
            "get_order",
            crate::broker::BrokerError::Transient("down".to_string()),
        );

        fx.poller.poll_once().await.unwrap();
        assert_eq!(fx.bus.size(), 0);
    }

    #[tokio::test]
    async fn terminal_orders_are_not_polled() {
        let fx = fixture();
        seed_intent(&fx, "c-1", "broker-1", dec!(30));
        fx.store
            .update_order_intent("c-1", "filled", Some(dec!(30)), None, Some(187.0))
            .unwrap();

        fx.poller.poll_once().await.unwrap();
        assert_eq!(fx.broker.call_count("get_order"), 0);
    }
}
