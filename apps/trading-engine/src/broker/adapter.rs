//! Timeout / retry / cache façade over a [`Broker`] implementation.
//!
//! Reads get a deadline (default 5 s), retries with jittered exponential
//! backoff, and a short TTL cache. Writes get a longer deadline (10 s) and
//! are never retried: submissions are only idempotent through the
//! deterministic client-order-id path, so the retry decision stays with the
//! caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::retry::RetryPolicy;
use super::{
    Account, Asset, Bar, Broker, BrokerError, BrokerOrder, BrokerPosition, Clock, NewOrder,
    Snapshot,
};

/// Adapter settings.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Deadline for read operations.
    pub read_timeout: Duration,
    /// Deadline for write operations.
    pub write_timeout: Duration,
    /// Retry policy for reads.
    pub retry: RetryPolicy,
    /// Whether the TTL cache is enabled.
    pub enable_cache: bool,
    /// TTL for `get_clock`.
    pub clock_ttl: Duration,
    /// TTL for `get_account`.
    pub account_ttl: Duration,
    /// TTL for `get_positions`.
    pub positions_ttl: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            enable_cache: true,
            clock_ttl: Duration::from_secs(2),
            account_ttl: Duration::from_secs(1),
            positions_ttl: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Clock(Clock),
    Account(Account),
    Positions(Vec<BrokerPosition>),
}

#[derive(Debug, Clone)]
struct CacheItem {
    value: CachedValue,
    expires_at: Instant,
}

/// Cache hit/miss/invalidation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Cache hits.
    pub hits: u64,
    /// Cache misses (including expirations).
    pub misses: u64,
    /// Entries invalidated by writes.
    pub invalidations: u64,
}

/// The façade the rest of the engine talks to.
pub struct BrokerAdapter {
    inner: Arc<dyn Broker>,
    config: AdapterConfig,
    cache: Mutex<HashMap<&'static str, CacheItem>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl BrokerAdapter {
    /// Wrap a broker implementation.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, config: AdapterConfig) -> Self {
        Self {
            inner,
            config,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Current cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn cache_get(&self, key: &'static str) -> Option<CachedValue> {
        if !self.config.enable_cache {
            return None;
        }
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match cache.get(key) {
            Some(item) if item.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(item.value.clone())
            }
            Some(_) => {
                cache.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn cache_set(&self, key: &'static str, value: CachedValue, ttl: Duration) {
        if !self.config.enable_cache {
            return;
        }
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(
            key,
            CacheItem {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop specific cache keys (called after writes).
    pub fn invalidate_cache(&self, keys: &[&'static str]) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in keys {
            if cache.remove(key).is_some() {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run a read with deadline and retry.
    async fn run_read<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let timeout = self.config.read_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if !err.is_transient() => return Err(err),
                Ok(Err(err)) => err,
                Err(_) => BrokerError::Timeout {
                    operation: operation.to_string(),
                    timeout_secs: timeout.as_secs(),
                },
            };

            match self.config.retry.backoff_for(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %outcome,
                        "Transient broker error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::warn!(operation, attempt, error = %outcome, "Broker read retries exhausted");
                    return Err(BrokerError::MaxRetriesExceeded { attempts: attempt });
                }
            }
        }
    }

    /// Run a write with deadline and no retry.
    async fn run_write<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, BrokerError>
    where
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let timeout = self.config.write_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                operation: operation.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl Broker for BrokerAdapter {
    async fn get_clock(&self) -> Result<Clock, BrokerError> {
        if let Some(CachedValue::Clock(clock)) = self.cache_get("get_clock") {
            return Ok(clock);
        }
        let clock = self
            .run_read("get_clock", || self.inner.get_clock())
            .await?;
        self.cache_set(
            "get_clock",
            CachedValue::Clock(clock.clone()),
            self.config.clock_ttl,
        );
        Ok(clock)
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        if let Some(CachedValue::Account(account)) = self.cache_get("get_account") {
            return Ok(account);
        }
        let account = self
            .run_read("get_account", || self.inner.get_account())
            .await?;
        self.cache_set(
            "get_account",
            CachedValue::Account(account.clone()),
            self.config.account_ttl,
        );
        Ok(account)
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        if let Some(CachedValue::Positions(positions)) = self.cache_get("get_positions") {
            return Ok(positions);
        }
        let positions = self
            .run_read("get_positions", || self.inner.get_positions())
            .await?;
        self.cache_set(
            "get_positions",
            CachedValue::Positions(positions.clone()),
            self.config.positions_ttl,
        );
        Ok(positions)
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.run_read("get_open_orders", || self.inner.get_open_orders())
            .await
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError> {
        self.run_read("get_order", || self.inner.get_order(broker_order_id))
            .await
    }

    async fn submit_order(&self, order: &NewOrder) -> Result<BrokerOrder, BrokerError> {
        let result = self
            .run_write("submit_order", self.inner.submit_order(order))
            .await;
        if result.is_ok() {
            self.invalidate_cache(&["get_open_orders", "get_positions"]);
        }
        result
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let result = self
            .run_write("cancel_order", self.inner.cancel_order(broker_order_id))
            .await;
        if result.is_ok() {
            self.invalidate_cache(&["get_open_orders", "get_positions"]);
        }
        result
    }

    async fn get_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        start: DateTime<Utc>,
        limit: usize,
        feed: &str,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        self.run_read("get_bars", || {
            self.inner.get_bars(symbols, timeframe, start, limit, feed)
        })
        .await
    }

    async fn get_crypto_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        start: DateTime<Utc>,
        limit: usize,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        self.run_read("get_crypto_bars", || {
            self.inner.get_crypto_bars(symbols, timeframe, start, limit)
        })
        .await
    }

    async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, BrokerError> {
        self.run_read("get_snapshot", || self.inner.get_snapshot(symbol))
            .await
    }

    async fn get_asset(&self, symbol: &str) -> Result<Asset, BrokerError> {
        self.run_read("get_asset", || self.inner.get_asset(symbol))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::broker::OrderSide;
    use rust_decimal_macros::dec;

    fn fast_config() -> AdapterConfig {
        AdapterConfig {
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                factor: 1.0,
                jitter: (1.0, 1.0),
            },
            ..AdapterConfig::default()
        }
    }

    fn new_order() -> NewOrder {
        NewOrder {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(1),
            client_order_id: "abcdef0123456789".to_string(),
            order_type: crate::broker::OrderType::Market,
            limit_price: None,
            time_in_force: "day".to_string(),
        }
    }

    #[tokio::test]
    async fn read_retries_transient_then_succeeds() {
        let mock = Arc::new(MockBroker::new());
        mock.push_failure("get_clock", BrokerError::Transient("502".into()));
        mock.push_failure("get_clock", BrokerError::Transient("502".into()));
        let adapter = BrokerAdapter::new(mock.clone(), fast_config());

        let clock = adapter.get_clock().await.unwrap();
        assert!(clock.is_open);
        assert_eq!(mock.call_count("get_clock"), 3);
    }

    #[tokio::test]
    async fn read_does_not_retry_fatal() {
        let mock = Arc::new(MockBroker::new());
        mock.push_failure("get_clock", BrokerError::Fatal("bad auth".into()));
        let adapter = BrokerAdapter::new(mock.clone(), fast_config());

        let err = adapter.get_clock().await.unwrap_err();
        assert!(matches!(err, BrokerError::Fatal(_)));
        assert_eq!(mock.call_count("get_clock"), 1);
    }

    #[tokio::test]
    async fn read_exhausts_retries() {
        let mock = Arc::new(MockBroker::new());
        for _ in 0..5 {
            mock.push_failure("get_account", BrokerError::Transient("down".into()));
        }
        let adapter = BrokerAdapter::new(mock.clone(), fast_config());

        let err = adapter.get_account().await.unwrap_err();
        assert!(matches!(err, BrokerError::MaxRetriesExceeded { attempts: 3 }));
        assert_eq!(mock.call_count("get_account"), 3);
    }

    #[tokio::test]
    async fn write_is_never_retried() {
        let mock = Arc::new(MockBroker::new());
        mock.push_failure("submit_order", BrokerError::Transient("reset".into()));
        let adapter = BrokerAdapter::new(mock.clone(), fast_config());

        let err = adapter.submit_order(&new_order()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.call_count("submit_order"), 1);
    }

    #[tokio::test]
    async fn clock_is_cached_within_ttl() {
        let mock = Arc::new(MockBroker::new());
        let adapter = BrokerAdapter::new(mock.clone(), fast_config());

        adapter.get_clock().await.unwrap();
        adapter.get_clock().await.unwrap();
        assert_eq!(mock.call_count("get_clock"), 1);
        assert_eq!(adapter.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn submit_invalidates_positions_cache() {
        let mock = Arc::new(MockBroker::new());
        let adapter = BrokerAdapter::new(mock.clone(), fast_config());

        adapter.get_positions().await.unwrap();
        adapter.get_positions().await.unwrap();
        assert_eq!(mock.call_count("get_positions"), 1);

        adapter.submit_order(&new_order()).await.unwrap();
        adapter.get_positions().await.unwrap();
        assert_eq!(mock.call_count("get_positions"), 2);
        assert!(adapter.cache_stats().invalidations >= 1);
    }

    #[tokio::test]
    async fn cache_can_be_disabled() {
        let mock = Arc::new(MockBroker::new());
        let config = AdapterConfig {
            enable_cache: false,
            ..fast_config()
        };
        let adapter = BrokerAdapter::new(mock.clone(), config);

        adapter.get_clock().await.unwrap();
        adapter.get_clock().await.unwrap();
        assert_eq!(mock.call_count("get_clock"), 2);
    }
}
