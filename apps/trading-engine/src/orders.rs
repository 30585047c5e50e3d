//! Order submission: deterministic client order ids, duplicate
//! suppression, signal gating, and circuit-breaker coupling.
//!
//! The intent is persisted BEFORE the broker call so a crash between the
//! two leaves a record the reconciler can resolve, and the deterministic
//! id makes an accidental resubmission a no-op at every layer.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::broker::{Broker, NewOrder, OrderType};
use crate::events::{BusError, Event, EventBus, OrderIntentEvent, SignalAction, SignalEvent};
use crate::metrics::EngineMetrics;
use crate::notifier::{AlertNotifier, Severity};
use crate::store::{NewOrderIntent, StateStore, StoreError};

/// Consecutive submission failures that trip the circuit breaker.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// Errors from order management.
#[derive(Debug, Error)]
pub enum OrderError {
    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event bus failure while publishing the intent event.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Broker rejected or failed the submission.
    #[error("Order submission failed: {0}")]
    Submission(String),
}

/// What a signal means given the current broker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentDirection {
    /// Open a new long (gate consulted).
    EnterLong,
    /// Open a new short (gate consulted).
    EnterShort,
    /// Close an existing long (no gate).
    ExitLong,
    /// Cover an existing short (no gate).
    ExitShort,
}

impl IntentDirection {
    const fn is_entry(self) -> bool {
        matches!(self, Self::EnterLong | Self::EnterShort)
    }
}

/// Derive the deterministic client order id.
///
/// First 16 hex characters of
/// `SHA-256("{strategy}:{symbol}:{timeframe}:{signal_ts}:{side}")` with the
/// side trimmed and lowercased -- the normalization is a contract: a casing
/// difference must never mint a second order id for the same decision.
#[must_use]
pub fn client_order_id(
    strategy: &str,
    symbol: &str,
    timeframe: &str,
    signal_ts: DateTime<Utc>,
    side: &str,
) -> String {
    let normalized_side = side.trim().to_lowercase();
    let data = format!(
        "{strategy}:{symbol}:{timeframe}:{}:{normalized_side}",
        signal_ts.to_rfc3339()
    );
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Submits orders derived from signals.
pub struct OrderManager {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    notifier: Arc<AlertNotifier>,
    metrics: Arc<EngineMetrics>,
    strategy_name: String,
    timeframe: String,
    order_type: OrderType,
    time_in_force: String,
    dry_run: bool,
    gate_cooldown: Duration,
}

impl OrderManager {
    /// Create an order manager.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        notifier: Arc<AlertNotifier>,
        metrics: Arc<EngineMetrics>,
        strategy_name: &str,
        timeframe: &str,
        order_type: OrderType,
        time_in_force: &str,
        dry_run: bool,
        gate_cooldown_seconds: i64,
    ) -> Self {
        Self {
            broker,
            store,
            bus,
            notifier,
            metrics,
            strategy_name: strategy_name.to_string(),
            timeframe: timeframe.to_string(),
            order_type,
            time_in_force: time_in_force.to_string(),
            dry_run,
            gate_cooldown: Duration::seconds(gate_cooldown_seconds),
        }
    }

    /// Submit an order for a signal.
    ///
    /// Returns `false` when the order was suppressed (duplicate, gate
    /// rejection, or a position state that makes the signal a no-op).
    pub async fn submit_order(
        &self,
        signal: &SignalEvent,
        qty: Decimal,
    ) -> Result<bool, OrderError> {
        let symbol = &signal.symbol;
        let side = signal.action.order_side();

        tracing::info!(
            symbol,
            side = side.as_str(),
            pair = ?signal.metadata.sma_period,
            confidence = signal.metadata.confidence,
            regime = signal.metadata.regime.as_str(),
            "Trading signal"
        );

        let id = client_order_id(
            &self.strategy_name,
            symbol,
            &self.timeframe,
            signal.timestamp,
            side.as_str(),
        );

        let Some(direction) = self.decide_direction(symbol, signal.action).await else {
            return Ok(false);
        };

        // Entry dedupe and cooldown; exits and covers bypass the gate.
        if direction.is_entry() {
            let accepted = self.store.gate_try_accept(
                &self.strategy_name,
                symbol,
                signal.action.as_str(),
                Utc::now(),
                Some(signal.timestamp),
                self.gate_cooldown,
            )?;
            if !accepted {
                tracing::info!(symbol, action = signal.action.as_str(), "Signal gated");
                return Ok(false);
            }
        }

        // Persist the intent before touching the broker.
        let inserted = self.store.save_order_intent(&NewOrderIntent {
            client_order_id: &id,
            symbol,
            side,
            qty,
            atr: signal.metadata.atr,
            status: "new",
            strategy: &self.strategy_name,
        })?;
        if !inserted {
            tracing::info!(client_order_id = id, "Duplicate order prevented");
            return Ok(false);
        }

        if self.dry_run {
            tracing::info!(symbol, side = side.as_str(), %qty, client_order_id = id, "[DRY RUN] Would submit");
            self.store
                .update_order_intent(&id, "dry_run", None, None, None)?;
            return Ok(true);
        }

        let order = NewOrder {
            symbol: symbol.clone(),
            side,
            qty,
            client_order_id: id.clone(),
            order_type: self.order_type,
            limit_price: None,
            time_in_force: self.time_in_force.clone(),
        };
        match self.broker.submit_order(&order).await {
            Ok(ack) => {
                self.store
                    .update_order_intent(&id, "submitted", None, Some(&ack.id), None)?;
                self.bus
                    .publish(Event::OrderIntent(OrderIntentEvent {
                        client_order_id: id.clone(),
                        symbol: symbol.clone(),
                        side,
                        qty,
                        timestamp: Utc::now(),
                    }))
                    .await?;
                EngineMetrics::inc(&self.metrics.orders_submitted);
                tracing::info!(client_order_id = id, broker_order_id = ack.id, "Order submitted");
                Ok(true)
            }
            Err(err) => {
                self.record_submission_failure(&id).await?;
                Err(OrderError::Submission(err.to_string()))
            }
        }
    }

    /// Interpret a signal against current broker positions.
    ///
    /// A failed positions fetch is treated conservatively: the signal may
    /// only close an existing position, never open a new one.
    async fn decide_direction(
        &self,
        symbol: &str,
        action: SignalAction,
    ) -> Option<IntentDirection> {
        let held = match self.broker.get_positions().await {
            Ok(positions) => positions
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.qty),
            Err(err) => {
                tracing::warn!(
                    symbol,
                    error = %err,
                    "Positions fetch failed; treating signal as exit-only"
                );
                return Some(match action {
                    SignalAction::Buy => IntentDirection::ExitShort,
                    SignalAction::Sell => IntentDirection::ExitLong,
                });
            }
        };

        match (action, held) {
            (SignalAction::Buy, None) => Some(IntentDirection::EnterLong),
            (SignalAction::Sell, None) => Some(IntentDirection::EnterShort),
            (SignalAction::Buy, Some(qty)) if qty > Decimal::ZERO => {
                tracing::info!(symbol, "BUY ignored: already long");
                None
            }
            (SignalAction::Buy, Some(_)) => Some(IntentDirection::ExitShort),
            (SignalAction::Sell, Some(qty)) if qty > Decimal::ZERO => {
                Some(IntentDirection::ExitLong)
            }
            (SignalAction::Sell, Some(_)) => {
                tracing::info!(symbol, "SELL ignored: already short");
                None
            }
        }
    }

    /// Count a submission failure; at the threshold, trip the breaker and
    /// raise a critical alert.
    async fn record_submission_failure(&self, client_order_id: &str) -> Result<(), StoreError> {
        let failures = self.store.get_circuit_breaker_count()? + 1;
        self.store.save_circuit_breaker_count(failures)?;
        EngineMetrics::inc(&self.metrics.orders_rejected);
        tracing::error!(client_order_id, failures, "Order submission failed");

        if failures >= CIRCUIT_BREAKER_THRESHOLD {
            self.store.set_state("circuit_breaker_state", "tripped")?;
            tracing::error!(failures, "Circuit breaker tripped");
            self.notifier
                .send_alert(
                    "Circuit breaker tripped",
                    &format!("{failures} consecutive order submission failures; trading refused until reset"),
                    Severity::Critical,
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::broker::{BrokerError, OrderSide};
    use crate::events::SignalMetadata;
    use crate::store::testing::temp_store;
    use crate::strategy::Regime;
    use rust_decimal_macros::dec;

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: Arc<MockBroker>,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        manager: OrderManager,
    }

    fn fixture(dry_run: bool) -> Fixture {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let broker = Arc::new(MockBroker::new());
        let bus = Arc::new(EventBus::with_defaults());
        bus.start();
        let manager = OrderManager::new(
            broker.clone(),
            store.clone(),
            bus.clone(),
            Arc::new(AlertNotifier::new(None)),
            Arc::new(EngineMetrics::new()),
            "sma_crossover",
            "1Min",
            OrderType::Market,
            "day",
            dry_run,
            300,
        );
        Fixture {
            _dir: dir,
            broker,
            store,
            bus,
            manager,
        }
    }

    fn signal_at(symbol: &str, action: SignalAction, ts: DateTime<Utc>) -> SignalEvent {
        SignalEvent {
            symbol: symbol.to_string(),
            action,
            timestamp: ts,
            metadata: SignalMetadata {
                sma_period: (10, 30),
                confidence: 0.9,
                regime: Regime::Trending,
                atr: Some(2.0),
                regime_strength: Some(0.9),
            },
        }
    }

    #[test]
    fn client_order_id_is_deterministic() {
        let ts = Utc::now();
        let a = client_order_id("sma_crossover", "AAPL", "1Min", ts, "buy");
        let b = client_order_id("sma_crossover", "AAPL", "1Min", ts, "buy");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn client_order_id_normalizes_side() {
        let ts = Utc::now();
        let canonical = client_order_id("s", "AAPL", "1Min", ts, "buy");
        assert_eq!(client_order_id("s", "AAPL", "1Min", ts, " BUY "), canonical);
        assert_eq!(client_order_id("s", "AAPL", "1Min", ts, "Buy"), canonical);
        // Side is part of the hash: the opposite decision gets its own id.
        assert_ne!(client_order_id("s", "AAPL", "1Min", ts, "sell"), canonical);
    }

    #[test]
    fn client_order_id_varies_with_inputs() {
        let ts = Utc::now();
        let base = client_order_id("s", "AAPL", "1Min", ts, "buy");
        assert_ne!(client_order_id("other", "AAPL", "1Min", ts, "buy"), base);
        assert_ne!(client_order_id("s", "MSFT", "1Min", ts, "buy"), base);
        assert_ne!(client_order_id("s", "AAPL", "5Min", ts, "buy"), base);
        assert_ne!(
            client_order_id("s", "AAPL", "1Min", ts + Duration::seconds(60), "buy"),
            base
        );
    }

    #[tokio::test]
    async fn entry_submits_and_publishes_intent() {
        let fx = fixture(false);
        let ts = Utc::now();
        let submitted = fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Buy, ts), dec!(1))
            .await
            .unwrap();
        assert!(submitted);
        assert_eq!(fx.broker.submitted.lock().unwrap().len(), 1);

        match fx.bus.recv().await.unwrap() {
            Event::OrderIntent(intent) => {
                assert_eq!(intent.symbol, "AAPL");
                assert_eq!(intent.side, OrderSide::Buy);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Intent persisted as submitted with a broker id and the signal ATR.
        let id = client_order_id("sma_crossover", "AAPL", "1Min", ts, "buy");
        let intent = fx.store.get_order_intent(&id).unwrap().unwrap();
        assert_eq!(intent.status, "submitted");
        assert!(intent.broker_order_id.is_some());
        assert_eq!(intent.atr, Some(2.0));
    }

    #[tokio::test]
    async fn exit_bypasses_gate_but_duplicate_intent_is_suppressed() {
        let fx = fixture(false);
        // Existing long: a SELL is an exit and never consults the gate.
        fx.broker.add_position("AAPL", dec!(10), 100.0);
        let ts = Utc::now();
        let signal = signal_at("AAPL", SignalAction::Sell, ts);

        assert!(fx.manager.submit_order(&signal, dec!(10)).await.unwrap());
        // Second identical decision: same deterministic id, intent-level
        // duplicate suppression, no second broker call.
        assert!(!fx.manager.submit_order(&signal, dec!(10)).await.unwrap());
        assert_eq!(fx.broker.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn buy_while_long_is_rejected() {
        let fx = fixture(false);
        fx.broker.add_position("AAPL", dec!(10), 100.0);
        let submitted = fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Buy, Utc::now()), dec!(1))
            .await
            .unwrap();
        assert!(!submitted);
        assert!(fx.broker.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn buy_while_short_covers_without_gate() {
        let fx = fixture(false);
        fx.broker.add_position("AAPL", dec!(-10), 100.0);
        let submitted = fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Buy, Utc::now()), dec!(10))
            .await
            .unwrap();
        assert!(submitted);
        let submitted_orders = fx.broker.submitted.lock().unwrap();
        assert_eq!(submitted_orders[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn sell_with_no_position_enters_short_via_gate() {
        let fx = fixture(false);
        let ts = Utc::now();
        assert!(fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Sell, ts), dec!(1))
            .await
            .unwrap());
        // Same bar timestamp again: the gate rejects before any intent is
        // written (the second decision would have the same id anyway).
        assert!(!fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Sell, ts), dec!(1))
            .await
            .unwrap());
        assert_eq!(fx.broker.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn positions_fetch_failure_means_exit_only() {
        let fx = fixture(false);
        fx.broker
            .push_failure("get_positions", BrokerError::Transient("down".to_string()));
        // BUY with an unknown position state may only cover a short; it is
        // submitted without consulting the entry gate.
        let submitted = fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Buy, Utc::now()), dec!(1))
            .await
            .unwrap();
        assert!(submitted);
    }

    #[tokio::test]
    async fn dry_run_persists_intent_without_submitting() {
        let fx = fixture(true);
        let ts = Utc::now();
        let submitted = fx
            .manager
            .submit_order(&signal_at("AAPL", SignalAction::Buy, ts), dec!(1))
            .await
            .unwrap();
        assert!(submitted);
        assert!(fx.broker.submitted.lock().unwrap().is_empty());

        let id = client_order_id("sma_crossover", "AAPL", "1Min", ts, "buy");
        let intent = fx.store.get_order_intent(&id).unwrap().unwrap();
        assert_eq!(intent.status, "dry_run");
    }

    #[tokio::test]
    async fn submission_failures_trip_the_circuit_breaker() {
        let fx = fixture(false);
        // Zero cooldown so distinct bars are not gated between attempts.
        let manager = OrderManager::new(
            fx.broker.clone(),
            fx.store.clone(),
            fx.bus.clone(),
            Arc::new(AlertNotifier::new(None)),
            Arc::new(EngineMetrics::new()),
            "sma_crossover",
            "1Min",
            OrderType::Market,
            "day",
            false,
            0,
        );

        let base = Utc::now();
        for i in 0..5 {
            fx.broker.push_failure(
                "submit_order",
                BrokerError::Transient("rejected".to_string()),
            );
            // Distinct bar timestamps: each attempt is a fresh decision.
            let signal = signal_at("AAPL", SignalAction::Buy, base + Duration::seconds(i * 60));
            let err = manager.submit_order(&signal, dec!(1)).await;
            assert!(matches!(err, Err(OrderError::Submission(_))));
        }

        assert_eq!(fx.store.get_circuit_breaker_count().unwrap(), 5);
        assert_eq!(
            fx.store
                .get_state("circuit_breaker_state")
                .unwrap()
                .as_deref(),
            Some("tripped")
        );
    }
}
