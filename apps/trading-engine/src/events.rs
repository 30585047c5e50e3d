//! Typed event bus: bounded single-consumer pub/sub.
//!
//! Backpressure policy: a publish that cannot enqueue within the timeout
//! drops the event and counts it -- except for exit signals, which are
//! critical and surface the failure to the caller instead. A stale bar or
//! signal is superseded by the next tick; a lost exit is not.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};

use crate::broker::OrderSide;
use crate::exits::ExitReason;
use crate::strategy::Regime;

/// Default bound of the event queue.
pub const DEFAULT_BUS_CAPACITY: usize = 1000;

/// Default time a publisher waits for queue space.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors from the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// A critical event could not be enqueued within the publish timeout.
    #[error("Event bus overflow on critical event: {kind}")]
    CriticalOverflow {
        /// Kind of the event that failed to enqueue.
        kind: &'static str,
    },

    /// The bus has been stopped.
    #[error("Event bus is closed")]
    Closed,
}

/// Buy/sell direction of a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Bullish crossover.
    Buy,
    /// Bearish crossover.
    Sell,
}

impl SignalAction {
    /// Canonical uppercase name, as persisted in the last-signal memory.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// The order side this action maps to.
    #[must_use]
    pub const fn order_side(&self) -> OrderSide {
        match self {
            Self::Buy => OrderSide::Buy,
            Self::Sell => OrderSide::Sell,
        }
    }
}

/// A normalized market bar.
#[derive(Debug, Clone, PartialEq)]
pub struct BarEvent {
    /// Symbol the bar belongs to.
    pub symbol: String,
    /// Bar timestamp (open time, UTC).
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume.
    pub volume: u64,
    /// Number of trades in the bar, when the feed provides it.
    pub trade_count: Option<u64>,
    /// Volume-weighted average price, when the feed provides it.
    pub vwap: Option<f64>,
}

/// Strategy signal metadata carried to risk and order management.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMetadata {
    /// (fast, slow) SMA periods that produced the signal.
    pub sma_period: (usize, usize),
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Market regime at signal time.
    pub regime: Regime,
    /// ATR(14) at signal time, for exit threshold calculation.
    pub atr: Option<f64>,
    /// Normalized regime strength in [0, 1].
    pub regime_strength: Option<f64>,
}

/// A trading signal emitted by the strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    /// Symbol.
    pub symbol: String,
    /// Direction.
    pub action: SignalAction,
    /// Close time of the bar that produced the signal; part of the
    /// deterministic client-order-id derivation.
    pub timestamp: DateTime<Utc>,
    /// Signal metadata.
    pub metadata: SignalMetadata,
}

/// Published after an order intent is submitted to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntentEvent {
    /// Deterministic client order id.
    pub client_order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Order quantity.
    pub qty: Decimal,
    /// Submission time.
    pub timestamp: DateTime<Utc>,
}

/// Published by the order-update poller when broker state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdateEvent {
    /// Broker-side order id.
    pub broker_order_id: String,
    /// Deterministic client order id.
    pub client_order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Broker-reported status string.
    pub status: String,
    /// Cumulative filled quantity as reported by the broker.
    pub cum_filled_qty: Decimal,
    /// Cumulative average fill price, when reported.
    pub cum_avg_price: Option<f64>,
    /// Newly filled quantity since the previous observation; zero when the
    /// update carries no new fill.
    pub delta_qty: Decimal,
    /// Observation time.
    pub timestamp: DateTime<Utc>,
    /// Broker fill id when one was supplied.
    pub fill_id: Option<String>,
}

/// Published by the exit manager when an exit rule fires.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignalEvent {
    /// Symbol.
    pub symbol: String,
    /// Closing side (sell closes a long, buy closes a short).
    pub side: OrderSide,
    /// Quantity to close.
    pub qty: Decimal,
    /// Which rule fired.
    pub reason: ExitReason,
    /// Position entry price.
    pub entry_price: f64,
    /// Price at evaluation time.
    pub current_price: f64,
    /// Unrealised P&L as a fraction of entry.
    pub pnl_pct: f64,
    /// Unrealised P&L amount.
    pub pnl_amount: f64,
    /// Evaluation time.
    pub timestamp: DateTime<Utc>,
}

/// All events carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// New market bar.
    Bar(BarEvent),
    /// Strategy signal.
    Signal(SignalEvent),
    /// Order intent submitted.
    OrderIntent(OrderIntentEvent),
    /// Broker order update.
    OrderUpdate(OrderUpdateEvent),
    /// Exit rule fired (critical: never silently dropped).
    ExitSignal(ExitSignalEvent),
}

impl Event {
    /// Short kind name for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bar(_) => "bar",
            Self::Signal(_) => "signal",
            Self::OrderIntent(_) => "order_intent",
            Self::OrderUpdate(_) => "order_update",
            Self::ExitSignal(_) => "exit_signal",
        }
    }

    /// Critical events propagate publish failures instead of being dropped.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::ExitSignal(_))
    }
}

/// Bounded single-consumer event bus.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    depth: AtomicUsize,
    dropped: AtomicU64,
    running: AtomicBool,
    publish_timeout: Duration,
}

impl EventBus {
    /// Create a bus with the given queue bound and publish timeout.
    #[must_use]
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            running: AtomicBool::new(false),
            publish_timeout,
        }
    }

    /// Create a bus with default capacity and timeout.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY, DEFAULT_PUBLISH_TIMEOUT)
    }

    /// Mark the bus as accepting events.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Event bus started");
    }

    /// Enqueue an event.
    ///
    /// On a full queue: critical events return `BusError::CriticalOverflow`;
    /// everything else is dropped, counted, and logged.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let kind = event.kind();
        match self.tx.send_timeout(event, self.publish_timeout).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(timed_out)) => {
                if timed_out.is_critical() {
                    tracing::error!(kind, "Event bus full; refusing to drop critical event");
                    return Err(BusError::CriticalOverflow { kind });
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(kind, "Event bus full; event dropped");
                Ok(())
            }
            Err(SendTimeoutError::Closed(_)) => Err(BusError::Closed),
        }
    }

    /// Dequeue the next event. Single consumer.
    ///
    /// Returns `None` once the bus is stopped and drained.
    pub async fn recv(&self) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        let event = rx.recv().await;
        if event.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        event
    }

    /// Current queue depth.
    #[must_use]
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Number of non-critical events dropped on overflow.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the bus: wait up to `drain_timeout` for the consumer to empty
    /// the queue, then close and log anything left behind.
    pub async fn stop(&self, drain_timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.size() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut remaining = 0usize;
        loop {
            match rx.try_recv() {
                Ok(_) => remaining += 1,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if remaining > 0 {
            tracing::warn!(remaining, "Event bus stopped with undelivered events");
        } else {
            tracing::info!("Event bus stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(symbol: &str) -> Event {
        Event::Bar(BarEvent {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100,
            trade_count: Some(10),
            vwap: None,
        })
    }

    fn exit_signal(symbol: &str) -> Event {
        Event::ExitSignal(ExitSignalEvent {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            qty: dec!(1),
            reason: ExitReason::StopLoss,
            entry_price: 100.0,
            current_price: 98.0,
            pnl_pct: -0.02,
            pnl_amount: -2.0,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn publish_and_recv_fifo() {
        let bus = EventBus::with_defaults();
        bus.start();
        bus.publish(bar("AAPL")).await.unwrap();
        bus.publish(bar("MSFT")).await.unwrap();
        assert_eq!(bus.size(), 2);

        match bus.recv().await.unwrap() {
            Event::Bar(b) => assert_eq!(b.symbol, "AAPL"),
            other => panic!("unexpected event: {other:?}"),
        }
        match bus.recv().await.unwrap() {
            Event::Bar(b) => assert_eq!(b.symbol, "MSFT"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(bus.size(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_non_critical_and_counts() {
        let bus = EventBus::new(1, Duration::from_millis(10));
        bus.start();
        bus.publish(bar("AAPL")).await.unwrap();
        // Queue full; this one is dropped, not an error.
        bus.publish(bar("MSFT")).await.unwrap();
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.size(), 1);
    }

    #[tokio::test]
    async fn overflow_on_exit_signal_is_an_error() {
        let bus = EventBus::new(1, Duration::from_millis(10));
        bus.start();
        bus.publish(bar("AAPL")).await.unwrap();

        let err = bus.publish(exit_signal("AAPL")).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::CriticalOverflow {
                kind: "exit_signal"
            }
        ));
        // Critical overflow is surfaced, never counted as a silent drop.
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn publish_before_start_is_closed() {
        let bus = EventBus::with_defaults();
        let err = bus.publish(bar("AAPL")).await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[tokio::test]
    async fn stop_reports_remaining() {
        let bus = EventBus::new(10, Duration::from_millis(10));
        bus.start();
        bus.publish(bar("AAPL")).await.unwrap();
        bus.stop(Duration::from_millis(50)).await;
        // Publishing after stop fails.
        let err = bus.publish(bar("MSFT")).await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(bar("A").kind(), "bar");
        assert_eq!(exit_signal("A").kind(), "exit_signal");
        assert!(exit_signal("A").is_critical());
        assert!(!bar("A").is_critical());
    }
}
