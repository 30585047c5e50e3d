//! Market data: rolling per-symbol bar history and the polling tasks that
//! feed it.

pub mod bars;
pub mod order_updates;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::broker::{Bar, Snapshot};

/// Default bars of history retained per symbol.
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Rolling per-symbol OHLCV history, deduped by bar timestamp.
pub struct PriceHistory {
    capacity: usize,
    inner: Mutex<HashMap<String, VecDeque<Bar>>>,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl PriceHistory {
    /// History with the given per-symbol capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Bar>>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append a bar. A bar whose timestamp equals the latest stored bar is
    /// ignored, so each (symbol, timestamp) is processed once.
    pub fn push(&self, symbol: &str, bar: Bar) -> bool {
        let mut inner = self.lock();
        let series = inner.entry(symbol.to_string()).or_default();
        if series.back().is_some_and(|last| last.timestamp == bar.timestamp) {
            return false;
        }
        series.push_back(bar);
        while series.len() > self.capacity {
            series.pop_front();
        }
        true
    }

    /// Snapshot of the stored series for a symbol, oldest first.
    #[must_use]
    pub fn series(&self, symbol: &str) -> Vec<Bar> {
        self.lock()
            .get(symbol)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Bars currently stored for a symbol.
    #[must_use]
    pub fn len(&self, symbol: &str) -> usize {
        self.lock().get(symbol).map_or(0, VecDeque::len)
    }

    /// Whether at least `min_bars` are stored for a symbol.
    #[must_use]
    pub fn has_sufficient_history(&self, symbol: &str, min_bars: usize) -> bool {
        self.len(symbol) >= min_bars
    }

    /// Trade count of the most recent bar, when the feed provided one.
    #[must_use]
    pub fn last_trade_count(&self, symbol: &str) -> Option<u64> {
        self.lock()
            .get(symbol)
            .and_then(|s| s.back())
            .and_then(|bar| bar.trade_count)
    }
}

/// Price to evaluate a position against: the last trade, else the bid.
#[must_use]
pub fn snapshot_price(snapshot: &Snapshot) -> Option<f64> {
    snapshot.last_price.or(snapshot.bid)
}
