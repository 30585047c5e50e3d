//! Historical-bar polling: the streaming tier has connection limits, so
//! bars are fetched over REST in per-asset-class batches, deduped by bar
//! timestamp, and published onto the event bus.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::broker::{Bar, Broker, BrokerError};
use crate::events::{BarEvent, BusError, Event, EventBus};
use crate::store::StateStore;
use crate::util::batch_chunks;

use super::PriceHistory;

/// Batch cap on the free feed: multi-symbol requests beyond two symbols
/// return incomplete data upstream, so requests are split down.
const FREE_FEED_BATCH_CAP: usize = 2;

/// Look-back window per poll; generous against clock skew.
const POLL_WINDOW_MINUTES: i64 = 5;

/// Bars requested per symbol per poll.
const POLL_BAR_LIMIT: usize = 10;

/// Delay before retrying after a cycle-level error.
const ERROR_RETRY: StdDuration = StdDuration::from_secs(5);

/// Bar poller settings.
#[derive(Debug, Clone)]
pub struct BarPollerConfig {
    /// Equity symbols.
    pub equity_symbols: Vec<String>,
    /// Crypto symbols (dedicated endpoint, no feed selection).
    pub crypto_symbols: Vec<String>,
    /// Bar timeframe, e.g. "1Min".
    pub timeframe: String,
    /// Equity feed: "iex" (free) or "sip" (premium).
    pub feed: String,
    /// Symbols per batch request on the premium feed.
    pub batch_size: usize,
}

/// Polls bars and publishes [`BarEvent`]s.
pub struct BarPoller {
    broker: Arc<dyn Broker>,
    bus: Arc<EventBus>,
    history: Arc<PriceHistory>,
    store: Arc<StateStore>,
    config: BarPollerConfig,
    last_bars: Mutex<HashMap<String, DateTime<Utc>>>,
    symbols_with_data: Mutex<HashSet<String>>,
    use_fallback: AtomicBool,
    feed_validated: AtomicBool,
    iterations: AtomicU64,
}

impl BarPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: Arc<EventBus>,
        history: Arc<PriceHistory>,
        store: Arc<StateStore>,
        config: BarPollerConfig,
    ) -> Self {
        Self {
            broker,
            bus,
            history,
            store,
            config,
            last_bars: Mutex::new(HashMap::new()),
            symbols_with_data: Mutex::new(HashSet::new()),
            use_fallback: AtomicBool::new(false),
            feed_validated: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
        }
    }

    /// The feed actually in use this session.
    #[must_use]
    pub fn active_feed(&self) -> &str {
        if self.use_fallback.load(Ordering::SeqCst) {
            "iex"
        } else {
            &self.config.feed
        }
    }

    /// Effective batch size: the free feed (chosen or fallen back to) is
    /// capped at two symbols per request.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        if self.active_feed() == "iex" {
            FREE_FEED_BATCH_CAP
        } else {
            self.config.batch_size
        }
    }

    /// Validate the premium feed with a single-symbol test request.
    ///
    /// A response complaining about subscription permissions falls back to
    /// the free feed for the rest of the session; any other error is
    /// propagated unchanged.
    pub async fn validate_feed(&self) -> Result<(), BrokerError> {
        if self.feed_validated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.config.feed != "sip" {
            tracing::info!("Using IEX feed");
            return Ok(());
        }

        let test_symbol = self
            .config
            .equity_symbols
            .first()
            .cloned()
            .unwrap_or_else(|| "AAPL".to_string());
        let start = Utc::now() - Duration::minutes(POLL_WINDOW_MINUTES);
        match self
            .broker
            .get_bars(&[test_symbol], &self.config.timeframe, start, 1, "sip")
            .await
        {
            Ok(_) => {
                tracing::info!("Using SIP feed");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string().to_lowercase();
                if message.contains("subscription") && message.contains("permit") {
                    tracing::warn!(
                        "SIP feed requires subscription; falling back to IEX. \
                         Set STREAM_FEED=iex to suppress this warning"
                    );
                    self.use_fallback.store(true, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// One complete poll cycle over both asset classes.
    pub async fn poll_once(&self) -> Result<(), BusError> {
        let batch = self.effective_batch_size();
        let start = Utc::now() - Duration::minutes(POLL_WINDOW_MINUTES);

        for symbols in batch_chunks(&self.config.equity_symbols, batch) {
            let result = self
                .broker
                .get_bars(
                    &symbols,
                    &self.config.timeframe,
                    start,
                    POLL_BAR_LIMIT,
                    self.active_feed(),
                )
                .await;
            self.handle_batch(&symbols, result).await?;
        }

        for symbols in batch_chunks(&self.config.crypto_symbols, batch.max(FREE_FEED_BATCH_CAP)) {
            let result = self
                .broker
                .get_crypto_bars(&symbols, &self.config.timeframe, start, POLL_BAR_LIMIT)
                .await;
            self.handle_batch(&symbols, result).await?;
        }

        let iteration = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if iteration % 5 == 0 {
            let covered = self.symbols_with_data.lock().map_or(0, |s| s.len());
            let total = self.config.equity_symbols.len() + self.config.crypto_symbols.len();
            tracing::debug!(covered, total, "Symbol coverage");
        }
        Ok(())
    }

    async fn handle_batch(
        &self,
        requested: &[String],
        result: Result<HashMap<String, Vec<Bar>>, BrokerError>,
    ) -> Result<(), BusError> {
        let bars_by_symbol = match result {
            Ok(bars) => bars,
            Err(err) => {
                tracing::warn!(symbols = ?requested, error = %err, "Batch polling error");
                return Ok(());
            }
        };

        let missing: Vec<&String> = requested
            .iter()
            .filter(|s| !bars_by_symbol.contains_key(*s))
            .collect();
        if !missing.is_empty() {
            tracing::debug!(symbols = ?missing, "No bar data returned");
        }

        for (symbol, bars) in bars_by_symbol {
            let Some(latest) = bars.last() else {
                continue;
            };

            // Dedupe on the latest bar's timestamp.
            {
                let mut last_bars = self
                    .last_bars
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if last_bars.get(&symbol) == Some(&latest.timestamp) {
                    continue;
                }
                last_bars.insert(symbol.clone(), latest.timestamp);
            }
            if let Ok(mut covered) = self.symbols_with_data.lock() {
                covered.insert(symbol.clone());
            }

            self.history.push(&symbol, latest.clone());
            if let Err(err) = self.store.record_bar(&symbol, &self.config.timeframe, latest) {
                tracing::warn!(symbol, error = %err, "Failed to record bar");
            }

            self.bus
                .publish(Event::Bar(BarEvent {
                    symbol: symbol.clone(),
                    timestamp: latest.timestamp,
                    open: latest.open,
                    high: latest.high,
                    low: latest.low,
                    close: latest.close,
                    volume: latest.volume,
                    trade_count: latest.trade_count,
                    vwap: latest.vwap,
                }))
                .await?;
        }
        Ok(())
    }

    /// Poll loop: validates the feed once, then polls aligned to minute
    /// boundaries, retrying after a short delay on cycle errors.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            equities = self.config.equity_symbols.len(),
            crypto = self.config.crypto_symbols.len(),
            feed = self.config.feed,
            "Bar polling started"
        );
        if let Err(err) = self.validate_feed().await {
            tracing::error!(error = %err, "Feed validation failed");
        }

        loop {
            match self.poll_once().await {
                Ok(()) => sleep_until_next_minute().await,
                Err(BusError::Closed) => {
                    tracing::info!("Event bus closed; bar polling stopped");
                    return;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Bar poll cycle failed");
                    tokio::time::sleep(ERROR_RETRY).await;
                }
            }
        }
    }
}

/// Sleep until the next UTC minute boundary (at least one second).
async fn sleep_until_next_minute() {
    let now = Utc::now();
    let next_minute = (now + Duration::minutes(1))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now + Duration::minutes(1));
    let wait = (next_minute - now)
        .to_std()
        .unwrap_or(StdDuration::from_secs(1))
        .max(StdDuration::from_secs(1));
    tokio::time::sleep(wait).await;
}
