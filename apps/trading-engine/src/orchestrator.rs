//! Phase-based startup, the single-consumer event processor, and graceful
//! shutdown.
//!
//! Phases:
//! 1. Infrastructure -- broker connection, schema migration, state store,
//!    startup reconciliation. Any failure aborts.
//! 2. Data layer -- event bus, price history, pollers (created, not
//!    started).
//! 3. Trading logic -- symbol validation, strategy, risk, orders,
//!    position tracker (loaded and broker-synced), exit manager,
//!    runtime reconciler, housekeeping.
//! 4. Runtime -- tasks spawned, signal handlers installed, wait for
//!    shutdown or a critical task failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::broker::adapter::{AdapterConfig, BrokerAdapter};
use crate::broker::alpaca::AlpacaClient;
use crate::broker::{Broker, NewOrder, OrderSide, OrderType};
use crate::config::Config;
use crate::data::bars::{BarPoller, BarPollerConfig};
use crate::data::order_updates::OrderUpdatePoller;
use crate::data::PriceHistory;
use crate::error::EngineError;
use crate::events::{
    Event, EventBus, ExitSignalEvent, OrderUpdateEvent, SignalAction, SignalEvent, SignalMetadata,
};
use crate::exits::ExitManager;
use crate::housekeeping::Housekeeping;
use crate::metrics::EngineMetrics;
use crate::notifier::{AlertNotifier, Severity};
use crate::orders::OrderManager;
use crate::positions::{PositionSide, PositionTracker};
use crate::reconcile::runtime::RuntimeReconciler;
use crate::reconcile::startup::{reconcile_startup, STARTUP_REPORT_PATH};
use crate::risk::{RiskManager, SignalDecision, SkipReason};
use crate::store::{schema, StateStore, TradeRecord};
use crate::strategy::{Regime, SmaCrossover};

/// Fixed order quantity until position sizing is configured.
const DEFAULT_ORDER_QTY: Decimal = Decimal::ONE;

/// How long the bus may drain during shutdown.
const BUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Phase-1 output.
struct Infrastructure {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
}

/// Phase-2 output.
struct DataLayer {
    bus: Arc<EventBus>,
    history: Arc<PriceHistory>,
}

/// Phase-3 output.
struct TradingLogic {
    processor: Arc<EventProcessor>,
    exits: Arc<ExitManager>,
    reconciler: Arc<RuntimeReconciler>,
    housekeeping: Arc<Housekeeping>,
}

/// Wires the engine together and runs it.
pub struct Orchestrator {
    config: Config,
    shutdown_started: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator for a validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Execute all phases; blocks until shutdown.
    pub async fn run(&self) -> Result<(), EngineError> {
        let infra = self.phase1_infrastructure().await?;
        let data = Self::phase2_data_layer();
        let trading = self.phase3_trading_logic(&infra, &data).await?;
        self.phase4_runtime(infra, data, trading).await
    }

    async fn phase1_infrastructure(&self) -> Result<Infrastructure, EngineError> {
        tracing::info!("Phase 1: infrastructure");

        let client = AlpacaClient::new(
            &self.config.alpaca_api_key,
            &self.config.alpaca_secret_key,
            self.config.alpaca_paper,
        )?;
        let broker: Arc<dyn Broker> =
            Arc::new(BrokerAdapter::new(Arc::new(client), AdapterConfig::default()));

        let account = broker.get_account().await?;
        tracing::info!(
            equity = account.equity,
            buying_power = account.buying_power,
            mode = if self.config.alpaca_paper { "paper" } else { "live" },
            "Broker connected"
        );

        // Schema migration runs before any other consumer opens the DB.
        schema::ensure_schema(&self.config.database_path, false)?;
        let store = Arc::new(StateStore::open(&self.config.database_path)?);

        if self.config.kill_switch {
            store.set_state("kill_switch", "true")?;
            tracing::warn!("Kill-switch engaged from environment");
        }
        if self.config.circuit_breaker_reset {
            store.save_circuit_breaker_count(0)?;
            store.set_state("circuit_breaker_state", "normal")?;
            tracing::warn!("Circuit breaker reset from environment");
        }

        reconcile_startup(
            broker.as_ref(),
            &store,
            std::path::Path::new(STARTUP_REPORT_PATH),
        )
        .await?;

        tracing::info!("Phase 1 complete");
        Ok(Infrastructure { broker, store })
    }

    fn phase2_data_layer() -> DataLayer {
        tracing::info!("Phase 2: data layer");
        let bus = Arc::new(EventBus::with_defaults());
        bus.start();
        let history = Arc::new(PriceHistory::default());
        tracing::info!("Phase 2 complete");
        DataLayer { bus, history }
    }

    async fn phase3_trading_logic(
        &self,
        infra: &Infrastructure,
        data: &DataLayer,
    ) -> Result<TradingLogic, EngineError> {
        tracing::info!("Phase 3: trading logic");

        // Validate the equity universe against the broker's asset registry.
        let mut symbols = Vec::new();
        for symbol in &self.config.symbols {
            match infra.broker.get_asset(symbol).await {
                Ok(asset) if asset.tradable => symbols.push(symbol.clone()),
                Ok(_) => tracing::warn!(symbol, "Symbol not tradable; dropped"),
                Err(err) => {
                    tracing::warn!(symbol, error = %err, "Asset lookup failed; dropped");
                }
            }
        }
        if symbols.is_empty() && self.config.crypto_symbols.is_empty() {
            return Err(EngineError::Config(
                "no tradable symbols after validation".to_string(),
            ));
        }
        tracing::info!(symbols = ?symbols, crypto = ?self.config.crypto_symbols, "Trading universe");

        let metrics = Arc::new(EngineMetrics::new());
        let notifier = Arc::new(AlertNotifier::new(self.config.alert_webhook_url.clone()));
        let strategy = Arc::new(SmaCrossover::new(infra.store.clone()));
        let risk = Arc::new(RiskManager::new(
            infra.broker.clone(),
            infra.store.clone(),
            data.history.clone(),
            &self.config,
        ));
        let orders = Arc::new(OrderManager::new(
            infra.broker.clone(),
            infra.store.clone(),
            data.bus.clone(),
            notifier.clone(),
            metrics.clone(),
            strategy.name(),
            &self.config.bar_timeframe,
            OrderType::parse(&self.config.order_type).unwrap_or(OrderType::Market),
            &self.config.time_in_force,
            self.config.dry_run,
            self.config.signal_cooldown_seconds,
        ));

        let tracker = Arc::new(PositionTracker::new(
            infra.broker.clone(),
            infra.store.clone(),
            self.config.exits.trailing_stop_enabled,
            self.config.exits.trailing_stop_activation_pct,
            self.config.exits.trailing_stop_trail_pct,
        ));
        let loaded = tracker.load_persisted()?;
        let sync = tracker.sync_with_broker().await?;
        tracing::info!(
            loaded,
            tracked = sync.total_tracked,
            mismatches = sync.mismatches.len(),
            "Position tracker ready"
        );

        let exits = Arc::new(ExitManager::new(
            infra.broker.clone(),
            tracker.clone(),
            data.bus.clone(),
            infra.store.clone(),
            self.config.exits.clone(),
        ));
        let reconciler = Arc::new(RuntimeReconciler::new(
            infra.broker.clone(),
            infra.store.clone(),
            tracker.clone(),
            &self.config.reconciler,
        ));
        let housekeeping = Arc::new(Housekeeping::new(infra.broker.clone(), infra.store.clone()));

        let processor = Arc::new(EventProcessor {
            history: data.history.clone(),
            strategy,
            risk,
            orders,
            tracker,
            store: infra.store.clone(),
            metrics,
            notifier,
            symbols,
        });

        tracing::info!("Phase 3 complete");
        Ok(TradingLogic {
            processor,
            exits,
            reconciler,
            housekeeping,
        })
    }

    async fn phase4_runtime(
        &self,
        infra: Infrastructure,
        data: DataLayer,
        trading: TradingLogic,
    ) -> Result<(), EngineError> {
        tracing::info!("Phase 4: runtime");

        let bar_poller = Arc::new(BarPoller::new(
            infra.broker.clone(),
            data.bus.clone(),
            data.history.clone(),
            infra.store.clone(),
            BarPollerConfig {
                equity_symbols: trading.processor.symbols.clone(),
                crypto_symbols: self.config.crypto_symbols.clone(),
                timeframe: self.config.bar_timeframe.clone(),
                feed: self.config.stream_feed.clone(),
                batch_size: self.config.batch_size,
            },
        ));
        let order_poller = Arc::new(OrderUpdatePoller::new(
            infra.broker.clone(),
            infra.store.clone(),
            data.bus.clone(),
        ));

        let mut tasks = Vec::new();
        tasks.push(("bar_poller", tokio::spawn(bar_poller.run())));
        tasks.push(("order_poller", tokio::spawn(order_poller.run())));
        tasks.push(("exit_manager", tokio::spawn(trading.exits.clone().run())));
        tasks.push(("reconciler", tokio::spawn(trading.reconciler.clone().run())));
        tasks.push(("housekeeping", tokio::spawn(trading.housekeeping.clone().run())));

        let processor = trading.processor.clone();
        let bus = data.bus.clone();
        let processor_task = tokio::spawn(async move {
            tracing::info!("Event processor started");
            while let Some(event) = bus.recv().await {
                processor.handle_event(event).await;
            }
            tracing::info!("Event processor stopped");
        });
        tasks.push(("event_processor", processor_task));

        tracing::info!("Trading engine ready");

        // Wait for a shutdown signal or any critical task ending.
        let mut result = Ok(());
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received");
            }
            (finished, index) = wait_for_first_finished(&mut tasks) => {
                let (name, _) = tasks.remove(index);
                if let Err(err) = finished {
                    tracing::error!(task = name, error = %err, "Task failure");
                }
                tracing::error!(task = name, "Critical task ended unexpectedly");
                result = Err(EngineError::Runtime(format!(
                    "critical task {name} ended unexpectedly"
                )));
            }
        }

        self.graceful_shutdown(&infra, &data.bus, tasks).await;
        result
    }

    /// Stop components in dependency order, cancel open orders, flatten
    /// positions, stop the bus. Idempotent: a second invocation is a no-op.
    async fn graceful_shutdown(
        &self,
        infra: &Infrastructure,
        bus: &Arc<EventBus>,
        tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
    ) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Graceful shutdown initiated");

        // The exit manager stops first so no new exit signals race the
        // flatten below; the pollers and remaining tasks follow.
        for (name, task) in tasks.iter().filter(|(name, _)| *name == "exit_manager") {
            task.abort();
            tracing::info!(task = name, "Task stopped");
        }
        for (name, task) in tasks.iter().filter(|(name, _)| *name != "exit_manager") {
            task.abort();
            tracing::info!(task = name, "Task stopped");
        }

        // Cancel every open order.
        match infra.broker.get_open_orders().await {
            Ok(orders) => {
                if orders.is_empty() {
                    tracing::info!("No open orders to cancel");
                }
                for order in orders {
                    match infra.broker.cancel_order(&order.id).await {
                        Ok(()) => tracing::info!(order_id = order.id, symbol = order.symbol, "Order canceled"),
                        Err(err) => tracing::error!(order_id = order.id, error = %err, "Cancel failed"),
                    }
                }
            }
            Err(err) => tracing::error!(error = %err, "Failed to list open orders"),
        }

        // Flatten every position; collect failures but keep going.
        match infra.broker.get_positions().await {
            Ok(positions) => {
                if positions.is_empty() {
                    tracing::info!("No open positions to close");
                }
                let mut failures = Vec::new();
                for position in positions {
                    let side = if position.qty > Decimal::ZERO {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    };
                    let order = NewOrder {
                        symbol: position.symbol.clone(),
                        side,
                        qty: position.qty.abs(),
                        client_order_id: format!(
                            "close_{}_{}",
                            position.symbol,
                            Utc::now().timestamp()
                        ),
                        order_type: OrderType::Market,
                        limit_price: None,
                        time_in_force: "day".to_string(),
                    };
                    match infra.broker.submit_order(&order).await {
                        Ok(_) => {
                            tracing::info!(symbol = position.symbol, qty = %order.qty, "Position flattened");
                        }
                        Err(err) => {
                            tracing::error!(symbol = position.symbol, error = %err, "Flatten failed");
                            failures.push(position.symbol.clone());
                        }
                    }
                }
                if !failures.is_empty() {
                    tracing::error!(symbols = ?failures, "Positions left open at shutdown");
                }
            }
            Err(err) => tracing::error!(error = %err, "Failed to list positions"),
        }

        bus.stop(BUS_DRAIN_TIMEOUT).await;
        tracing::info!("Shutdown complete");
    }
}

/// Await the first completed join handle, returning its result and index.
async fn wait_for_first_finished(
    tasks: &mut [(&'static str, tokio::task::JoinHandle<()>)],
) -> (Result<(), tokio::task::JoinError>, usize) {
    loop {
        for (index, (_, task)) in tasks.iter_mut().enumerate() {
            if task.is_finished() {
                return (task.await, index);
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Wait for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Single consumer of the event bus. The only component allowed to drive
/// strategy, risk, and order submission -- this serialization is what
/// keeps bar and exit handling race-free.
pub struct EventProcessor {
    history: Arc<PriceHistory>,
    strategy: Arc<SmaCrossover>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    tracker: Arc<PositionTracker>,
    store: Arc<StateStore>,
    metrics: Arc<EngineMetrics>,
    notifier: Arc<AlertNotifier>,
    symbols: Vec<String>,
}

impl EventProcessor {
    /// Dispatch one event.
    pub async fn handle_event(&self, event: Event) {
        match event {
            Event::Bar(bar) => self.handle_bar(&bar.symbol).await,
            Event::ExitSignal(exit) => self.handle_exit_signal(exit).await,
            Event::OrderUpdate(update) => self.handle_order_update(update).await,
            // Informational events; consumed for observability only.
            Event::Signal(_) | Event::OrderIntent(_) => {}
        }
    }

    async fn handle_bar(&self, symbol: &str) {
        if !self
            .history
            .has_sufficient_history(symbol, self.strategy.required_history())
        {
            return;
        }

        let series = self.history.series(symbol);
        let signals = match self.strategy.on_bar(symbol, &series) {
            Ok(signals) => signals,
            Err(err) => {
                tracing::error!(symbol, error = %err, "Strategy evaluation failed");
                return;
            }
        };

        for signal in signals {
            EngineMetrics::inc(&self.metrics.signals_generated);
            match self.risk.check_signal(&signal).await {
                Ok(SignalDecision::Proceed) => {
                    if let Err(err) = self.orders.submit_order(&signal, DEFAULT_ORDER_QTY).await {
                        tracing::error!(symbol, error = %err, "Order submission failed");
                    }
                }
                Ok(SignalDecision::Skip(SkipReason::LowConfidence(_))) => {
                    EngineMetrics::inc(&self.metrics.signals_filtered_confidence);
                }
                Ok(SignalDecision::Skip(_)) => {
                    EngineMetrics::inc(&self.metrics.signals_filtered_risk);
                }
                Err(err) => {
                    EngineMetrics::inc(&self.metrics.signals_filtered_risk);
                    tracing::error!(symbol, error = %err, "Signal refused by risk gate");
                }
            }
        }
    }

    async fn handle_exit_signal(&self, exit: ExitSignalEvent) {
        tracing::info!(
            symbol = exit.symbol,
            reason = %exit.reason,
            pnl_pct = exit.pnl_pct * 100.0,
            "Processing exit signal"
        );
        EngineMetrics::inc(&self.metrics.exits_triggered);

        // Exits undergo tier-1 validation only.
        if let Err(err) = self.risk.check_exit_order(&exit.symbol).await {
            tracing::error!(symbol = exit.symbol, error = %err, "Exit order refused");
            return;
        }

        let signal = SignalEvent {
            symbol: exit.symbol.clone(),
            action: match exit.side {
                OrderSide::Sell => SignalAction::Sell,
                OrderSide::Buy => SignalAction::Buy,
            },
            timestamp: exit.timestamp,
            metadata: SignalMetadata {
                sma_period: (0, 0),
                confidence: 1.0,
                regime: Regime::Unknown,
                atr: None,
                regime_strength: None,
            },
        };

        match self.orders.submit_order(&signal, exit.qty).await {
            Ok(true) => {
                if let Err(err) = self.tracker.stop_tracking(&exit.symbol) {
                    tracing::error!(symbol = exit.symbol, error = %err, "Failed to stop tracking");
                }
                self.notifier
                    .send_alert(
                        "Position exit",
                        &format!(
                            "{} {} ({:.1}% P&L, {})",
                            exit.symbol,
                            exit.qty,
                            exit.pnl_pct * 100.0,
                            exit.reason
                        ),
                        Severity::Warning,
                    )
                    .await;
            }
            Ok(false) => {
                tracing::warn!(symbol = exit.symbol, "Exit order suppressed as duplicate");
            }
            Err(err) => {
                tracing::error!(symbol = exit.symbol, error = %err, "Exit order submission failed");
            }
        }
    }

    async fn handle_order_update(&self, update: OrderUpdateEvent) {
        if update.status != "filled" {
            tracing::debug!(
                client_order_id = update.client_order_id,
                status = update.status,
                delta = %update.delta_qty,
                "Order update"
            );
            return;
        }

        EngineMetrics::inc(&self.metrics.orders_filled);

        // Record the completed trade; the uniqueness pairs coalesce
        // replays across restarts.
        if let Some(price) = update.cum_avg_price {
            let trade = TradeRecord {
                timestamp: update.timestamp,
                symbol: update.symbol.clone(),
                side: update.side,
                qty: update.cum_filled_qty,
                price,
                order_id: update.broker_order_id.clone(),
                client_order_id: update.client_order_id.clone(),
                fill_id: update.fill_id.clone(),
            };
            match self.store.record_trade(&trade) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(client_order_id = update.client_order_id, "Trade already recorded");
                }
                Err(err) => {
                    tracing::error!(client_order_id = update.client_order_id, error = %err, "Trade record failed");
                }
            }
        } else {
            tracing::warn!(
                client_order_id = update.client_order_id,
                "Filled order carries no average price"
            );
        }

        if let Err(err) = self.store.save_daily_trade_count(
            self.store.get_daily_trade_count().unwrap_or(0) + 1,
        ) {
            tracing::error!(error = %err, "Daily trade count update failed");
        }

        let tracked = self.tracker.get_position(&update.symbol);
        match tracked {
            // Opposite-side fill closes the tracked position.
            Some(position)
                if (position.side == PositionSide::Long && update.side == OrderSide::Sell)
                    || (position.side == PositionSide::Short && update.side == OrderSide::Buy) =>
            {
                if let Some(price) = update.cum_avg_price {
                    let (pnl_amount, pnl_pct) =
                        self.tracker.calculate_pnl(&update.symbol, price);
                    let daily = self.store.get_daily_pnl().unwrap_or(0.0) + pnl_amount;
                    if let Err(err) = self.store.save_daily_pnl(daily) {
                        tracing::error!(error = %err, "Daily P&L update failed");
                    }
                    tracing::info!(
                        symbol = update.symbol,
                        pnl_amount,
                        pnl_pct = pnl_pct * 100.0,
                        "Exit filled"
                    );
                }
                if let Err(err) = self.tracker.stop_tracking(&update.symbol) {
                    tracing::error!(symbol = update.symbol, error = %err, "Failed to stop tracking");
                }
            }
            // No tracked position: this fill opens one.
            None => {
                let Some(price) = update.cum_avg_price else {
                    tracing::warn!(symbol = update.symbol, "Entry fill without price; not tracked");
                    return;
                };
                let atr = self
                    .store
                    .get_order_intent(&update.client_order_id)
                    .ok()
                    .flatten()
                    .and_then(|intent| intent.atr);
                let side = match update.side {
                    OrderSide::Buy => PositionSide::Long,
                    OrderSide::Sell => PositionSide::Short,
                };
                if let Err(err) = self.tracker.start_tracking(
                    &update.symbol,
                    price,
                    update.cum_filled_qty,
                    side,
                    atr,
                ) {
                    tracing::error!(symbol = update.symbol, error = %err, "Failed to start tracking");
                }
            }
            // Same-direction fill on an existing position: not supported
            // as pyramiding; leave the tracked entry untouched.
            Some(position) => {
                tracing::warn!(
                    symbol = update.symbol,
                    side = %update.side,
                    tracked_side = position.side.as_str(),
                    "Fill in position direction ignored by tracker"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::broker::Bar;
    use crate::config::ExitConfig;
    use crate::exits::ExitReason;
    use crate::store::testing::temp_store;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: Arc<MockBroker>,
        store: Arc<StateStore>,
        history: Arc<PriceHistory>,
        tracker: Arc<PositionTracker>,
        bus: Arc<EventBus>,
        processor: EventProcessor,
    }

    fn fixture() -> Fixture {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let broker = Arc::new(MockBroker::new());
        let history = Arc::new(PriceHistory::default());
        let bus = Arc::new(EventBus::with_defaults());
        bus.start();
        let metrics = Arc::new(EngineMetrics::new());
        let notifier = Arc::new(AlertNotifier::new(None));
        let config = crate::config::Config {
            alpaca_api_key: "key".to_string(),
            alpaca_secret_key: "secret".to_string(),
            alpaca_paper: true,
            allow_live_trading: false,
            symbols: vec!["AAPL".to_string()],
            crypto_symbols: Vec::new(),
            bar_timeframe: "1Min".to_string(),
            stream_feed: "iex".to_string(),
            batch_size: 25,
            strategy_name: "sma_crossover".to_string(),
            signal_cooldown_seconds: 300,
            regular_limits: crate::config::RiskLimits::default(),
            extended_limits: crate::config::RiskLimits::default(),
            filters: crate::config::FilterConfig::default(),
            exits: ExitConfig::default(),
            reconciler: crate::config::ReconcilerConfig::default(),
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
            dry_run: false,
            kill_switch: false,
            circuit_breaker_reset: false,
            database_path: dir.path().join("test.db"),
            kill_switch_file: dir.path().join(".kill_switch"),
            alert_webhook_url: None,
            log_level: "info".to_string(),
        };
        let strategy = Arc::new(SmaCrossover::new(store.clone()));
        let risk = Arc::new(RiskManager::new(
            broker.clone(),
            store.clone(),
            history.clone(),
            &config,
        ));
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            store.clone(),
            bus.clone(),
            notifier.clone(),
            metrics.clone(),
            "sma_crossover",
            "1Min",
            OrderType::Market,
            "day",
            false,
            300,
        ));
        let tracker = Arc::new(PositionTracker::new(
            broker.clone(),
            store.clone(),
            false,
            0.01,
            0.005,
        ));
        let processor = EventProcessor {
            history: history.clone(),
            strategy,
            risk,
            orders,
            tracker: tracker.clone(),
            store: store.clone(),
            metrics,
            notifier,
            symbols: vec!["AAPL".to_string()],
        };
        Fixture {
            _dir: dir,
            broker,
            store,
            history,
            tracker,
            bus,
            processor,
        }
    }

    fn load_history(fx: &Fixture, closes: &[f64]) {
        let start = Utc::now();
        for (i, close) in closes.iter().enumerate() {
            fx.history.push(
                "AAPL",
                Bar {
                    timestamp: start + ChronoDuration::minutes(i as i64),
                    open: *close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close: *close,
                    volume: 1000,
                    trade_count: Some(100),
                    vwap: None,
                },
            );
        }
    }

    #[tokio::test]
    async fn bar_with_insufficient_history_is_ignored() {
        let fx = fixture();
        load_history(&fx, &vec![100.0; 10]);
        fx.processor.handle_event(bar_event()).await;
        assert!(fx.broker.submitted.lock().unwrap().is_empty());
    }

    fn bar_event() -> Event {
        Event::Bar(crate::events::BarEvent {
            symbol: "AAPL".to_string(),
            timestamp: Utc::now(),
            open: 100.0,
            high: 100.5,
            low: 99.5,
            close: 100.0,
            volume: 1000,
            trade_count: Some(100),
            vwap: None,
        })
    }

    #[tokio::test]
    async fn crossover_bar_submits_orders() {
        let fx = fixture();
        let mut closes = vec![100.0; 59];
        closes.push(150.0);
        load_history(&fx, &closes);

        fx.processor.handle_event(bar_event()).await;

        // Three BUY crossovers; risk passes (ranging is not detected on a
        // hard jump), gate accepts the first and dedupes the rest on the
        // same bar, so exactly one order goes out.
        assert_eq!(fx.broker.submitted.lock().unwrap().len(), 1);
        assert_eq!(
            fx.broker.submitted.lock().unwrap()[0].side,
            OrderSide::Buy
        );
    }

    #[tokio::test]
    async fn exit_signal_submits_and_stops_tracking() {
        let fx = fixture();
        fx.tracker
            .start_tracking("AAPL", 100.0, dec!(10), PositionSide::Long, None)
            .unwrap();

        let exit = ExitSignalEvent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            qty: dec!(10),
            reason: ExitReason::StopLoss,
            entry_price: 100.0,
            current_price: 98.0,
            pnl_pct: -0.02,
            pnl_amount: -20.0,
            timestamp: Utc::now(),
        };
        // Broker still holds the long so the SELL maps to an exit.
        fx.broker.add_position("AAPL", dec!(10), 100.0);

        fx.processor.handle_event(Event::ExitSignal(exit)).await;

        assert_eq!(fx.broker.submitted.lock().unwrap().len(), 1);
        assert!(fx.tracker.get_position("AAPL").is_none());
    }

    #[tokio::test]
    async fn exit_signal_refused_when_market_closed() {
        let fx = fixture();
        fx.tracker
            .start_tracking("AAPL", 100.0, dec!(10), PositionSide::Long, None)
            .unwrap();
        fx.broker
            .clock_open
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let exit = ExitSignalEvent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            qty: dec!(10),
            reason: ExitReason::StopLoss,
            entry_price: 100.0,
            current_price: 98.0,
            pnl_pct: -0.02,
            pnl_amount: -20.0,
            timestamp: Utc::now(),
        };
        fx.processor.handle_event(Event::ExitSignal(exit)).await;

        assert!(fx.broker.submitted.lock().unwrap().is_empty());
        // The position remains tracked for a later retry.
        assert!(fx.tracker.get_position("AAPL").is_some());
    }

    #[tokio::test]
    async fn entry_fill_starts_tracking_with_intent_atr() {
        let fx = fixture();
        fx.store
            .save_order_intent(&crate::store::NewOrderIntent {
                client_order_id: "c-1",
                symbol: "AAPL",
                side: OrderSide::Buy,
                qty: dec!(10),
                atr: Some(2.5),
                status: "submitted",
                strategy: "sma_crossover",
            })
            .unwrap();

        let update = OrderUpdateEvent {
            broker_order_id: "broker-1".to_string(),
            client_order_id: "c-1".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            status: "filled".to_string(),
            cum_filled_qty: dec!(10),
            cum_avg_price: Some(100.0),
            delta_qty: dec!(10),
            timestamp: Utc::now(),
            fill_id: None,
        };
        fx.processor.handle_event(Event::OrderUpdate(update)).await;

        let position = fx.tracker.get_position("AAPL").unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.qty, dec!(10));
        assert_eq!(position.atr, Some(2.5));
        assert_eq!(fx.store.get_daily_trade_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn exit_fill_updates_daily_pnl_and_stops_tracking() {
        let fx = fixture();
        fx.tracker
            .start_tracking("AAPL", 100.0, dec!(10), PositionSide::Long, None)
            .unwrap();

        let update = OrderUpdateEvent {
            broker_order_id: "broker-2".to_string(),
            client_order_id: "c-2".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            status: "filled".to_string(),
            cum_filled_qty: dec!(10),
            cum_avg_price: Some(102.0),
            delta_qty: dec!(10),
            timestamp: Utc::now(),
            fill_id: Some("f-1".to_string()),
        };
        fx.processor.handle_event(Event::OrderUpdate(update)).await;

        assert!(fx.tracker.get_position("AAPL").is_none());
        // +2 per share on 10 shares.
        assert!((fx.store.get_daily_pnl().unwrap() - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_terminal_update_is_informational() {
        let fx = fixture();
        let update = OrderUpdateEvent {
            broker_order_id: "broker-3".to_string(),
            client_order_id: "c-3".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            status: "partially_filled".to_string(),
            cum_filled_qty: dec!(5),
            cum_avg_price: Some(100.0),
            delta_qty: dec!(5),
            timestamp: Utc::now(),
            fill_id: None,
        };
        fx.processor.handle_event(Event::OrderUpdate(update)).await;
        assert!(fx.tracker.get_position("AAPL").is_none());
        assert_eq!(fx.store.get_daily_trade_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn risk_refusal_drops_signal_but_engine_continues() {
        let fx = fixture();
        fx.store.set_state("kill_switch", "true").unwrap();
        let mut closes = vec![100.0; 59];
        closes.push(150.0);
        load_history(&fx, &closes);

        fx.processor.handle_event(bar_event()).await;
        assert!(fx.broker.submitted.lock().unwrap().is_empty());

        // Engine keeps running: clearing the switch lets the next decision
        // through (fresh bar, fresh crossover state).
        fx.store.set_state("kill_switch", "false").unwrap();
        fx.processor.handle_event(bar_event()).await;
        // Last-signal memory now suppresses the same-direction crossover,
        // so still nothing -- but no panic and no poisoned state.
        let _ = fx.bus.size();
    }
}
