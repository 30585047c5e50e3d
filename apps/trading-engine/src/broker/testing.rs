//! Scripted in-memory broker used across the crate's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{
    Account, Asset, Bar, Broker, BrokerError, BrokerOrder, BrokerPosition, Clock, NewOrder,
    Snapshot,
};

/// Scripted broker: every operation can be primed with failures and state.
#[derive(Default)]
pub struct MockBroker {
    /// Whether `get_clock` reports the market open.
    pub clock_open: AtomicBool,
    equity: Mutex<f64>,
    /// Positions returned by `get_positions`.
    pub positions: Mutex<Vec<BrokerPosition>>,
    /// Orders returned by `get_open_orders`.
    pub open_orders: Mutex<Vec<BrokerOrder>>,
    /// Orders returned by `get_order`.
    pub orders_by_id: Mutex<HashMap<String, BrokerOrder>>,
    /// Every order passed to `submit_order`.
    pub submitted: Mutex<Vec<NewOrder>>,
    /// Every id passed to `cancel_order`.
    pub canceled: Mutex<Vec<String>>,
    /// Snapshots per symbol.
    pub snapshots: Mutex<HashMap<String, Snapshot>>,
    /// Bars per symbol.
    pub bars: Mutex<HashMap<String, Vec<Bar>>>,
    /// Recorded (symbols, feed) of every bar request; feed is `None` for
    /// crypto requests.
    pub bar_requests: Mutex<Vec<(Vec<String>, Option<String>)>>,
    /// Assets per symbol; unknown symbols default to a tradable us_equity.
    pub assets: Mutex<HashMap<String, Asset>>,
    fail_queues: Mutex<HashMap<String, VecDeque<BrokerError>>>,
    call_counts: Mutex<HashMap<String, u32>>,
    next_id: AtomicU32,
}

impl MockBroker {
    /// Fresh mock with an open market and 100k equity.
    #[must_use]
    pub fn new() -> Self {
        let mock = Self::default();
        mock.clock_open.store(true, Ordering::SeqCst);
        *mock.equity.lock().unwrap() = 100_000.0;
        mock
    }

    /// Queue an error for the next call of `operation`.
    pub fn push_failure(&self, operation: &str, error: BrokerError) {
        self.fail_queues
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `operation`.
    #[must_use]
    pub fn call_count(&self, operation: &str) -> u32 {
        *self.call_counts.lock().unwrap().get(operation).unwrap_or(&0)
    }

    /// Set account equity.
    pub fn set_equity(&self, equity: f64) {
        *self.equity.lock().unwrap() = equity;
    }

    /// Add a broker position.
    pub fn add_position(&self, symbol: &str, qty: Decimal, avg_entry_price: f64) {
        self.positions.lock().unwrap().push(BrokerPosition {
            symbol: symbol.to_string(),
            qty,
            avg_entry_price,
            current_price: None,
        });
    }

    /// Set the snapshot for a symbol.
    pub fn set_snapshot(&self, symbol: &str, last: Option<f64>, bid: Option<f64>, ask: Option<f64>) {
        self.snapshots.lock().unwrap().insert(
            symbol.to_string(),
            Snapshot {
                symbol: symbol.to_string(),
                last_price: last,
                bid,
                ask,
            },
        );
    }

    fn record(&self, operation: &str) -> Result<(), BrokerError> {
        *self
            .call_counts
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_insert(0) += 1;
        if let Some(queue) = self.fail_queues.lock().unwrap().get_mut(operation) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_clock(&self) -> Result<Clock, BrokerError> {
        self.record("get_clock")?;
        Ok(Clock {
            is_open: self.clock_open.load(Ordering::SeqCst),
            next_open: None,
            next_close: None,
            timestamp: Utc::now(),
        })
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        self.record("get_account")?;
        let equity = *self.equity.lock().unwrap();
        Ok(Account {
            equity,
            buying_power: equity * 2.0,
            cash: equity,
            portfolio_value: equity,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.record("get_positions")?;
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.record("get_open_orders")?;
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError> {
        self.record("get_order")?;
        self.orders_by_id
            .lock()
            .unwrap()
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Fatal(format!("not found: {broker_order_id}")))
    }

    async fn submit_order(&self, order: &NewOrder) -> Result<BrokerOrder, BrokerError> {
        self.record("submit_order")?;
        self.submitted.lock().unwrap().push(order.clone());
        let id = format!("broker-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let ack = BrokerOrder {
            id: id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            status: "accepted".to_string(),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            created_at: Some(Utc::now()),
            fill_id: None,
        };
        self.orders_by_id.lock().unwrap().insert(id, ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.record("cancel_order")?;
        self.canceled.lock().unwrap().push(broker_order_id.to_string());
        Ok(())
    }

    async fn get_bars(
        &self,
        symbols: &[String],
        _timeframe: &str,
        _start: DateTime<Utc>,
        _limit: usize,
        feed: &str,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        self.record("get_bars")?;
        self.bar_requests
            .lock()
            .unwrap()
            .push((symbols.to_vec(), Some(feed.to_string())));
        let all = self.bars.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|s| all.get(s).map(|bars| (s.clone(), bars.clone())))
            .collect())
    }

    async fn get_crypto_bars(
        &self,
        symbols: &[String],
        _timeframe: &str,
        _start: DateTime<Utc>,
        _limit: usize,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        self.record("get_crypto_bars")?;
        self.bar_requests
            .lock()
            .unwrap()
            .push((symbols.to_vec(), None));
        let all = self.bars.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|s| all.get(s).map(|bars| (s.clone(), bars.clone())))
            .collect())
    }

    async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, BrokerError> {
        self.record("get_snapshot")?;
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_asset(&self, symbol: &str) -> Result<Asset, BrokerError> {
        self.record("get_asset")?;
        Ok(self
            .assets
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Asset {
                symbol: symbol.to_string(),
                tradable: true,
                asset_class: "us_equity".to_string(),
            }))
    }
}
