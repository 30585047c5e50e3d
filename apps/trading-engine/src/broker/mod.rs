//! Broker interface: operations, result shapes, and the error taxonomy.
//!
//! The engine talks to the brokerage only through the [`Broker`] trait.
//! [`alpaca::AlpacaClient`] is the REST implementation;
//! [`adapter::BrokerAdapter`] wraps any implementation with timeouts,
//! read retries, and a TTL cache.

pub mod adapter;
pub mod alpaca;
pub mod retry;
#[cfg(test)]
pub mod testing;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from broker operations.
///
/// Transient errors are retried for reads; fatal errors never are.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// Operation exceeded its deadline. Transient for reads.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Deadline that was exceeded.
        timeout_secs: u64,
    },

    /// Network or upstream failure that may succeed on retry.
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// Authentication, permission, or invalid-argument failure. Never
    /// retried.
    #[error("Fatal broker error: {0}")]
    Fatal(String),

    /// Read retries exhausted.
    #[error("Max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Response could not be decoded.
    #[error("Broker response parse error: {0}")]
    Parse(String),
}

impl BrokerError {
    /// True when a retry could plausibly succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient(_))
    }
}

/// Classify an upstream error message as fatal or transient.
///
/// Message sniffing mirrors the broker's error vocabulary: anything
/// mentioning authentication, permissions, or invalid arguments will not
/// succeed on retry.
#[must_use]
pub fn classify_error_message(message: &str) -> BrokerError {
    let lower = message.to_lowercase();
    let fatal_markers = ["auth", "invalid", "unauthor", "forbidden", "permission"];
    if fatal_markers.iter().any(|m| lower.contains(m)) {
        BrokerError::Fatal(message.to_string())
    } else {
        BrokerError::Transient(message.to_string())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    /// The opposite side.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Parse a side string; trims and lowercases first.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order; requires a limit price.
    Limit,
}

impl OrderType {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }

    /// Parse an order type string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "market" => Some(Self::Market),
            "limit" => Some(Self::Limit),
            _ => None,
        }
    }
}

/// Market clock: the only source of truth for "is the market open".
#[derive(Debug, Clone, PartialEq)]
pub struct Clock {
    /// Whether the market is open right now.
    pub is_open: bool,
    /// Next session open.
    pub next_open: Option<DateTime<Utc>>,
    /// Next session close.
    pub next_close: Option<DateTime<Utc>>,
    /// Broker time of the observation.
    pub timestamp: DateTime<Utc>,
}

/// Account balances.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// Account equity.
    pub equity: f64,
    /// Buying power.
    pub buying_power: f64,
    /// Cash balance.
    pub cash: f64,
    /// Total portfolio value.
    pub portfolio_value: f64,
}

/// An open position at the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    /// Symbol.
    pub symbol: String,
    /// Signed quantity (negative for shorts).
    pub qty: Decimal,
    /// Average entry price.
    pub avg_entry_price: f64,
    /// Mark price, when reported.
    pub current_price: Option<f64>,
}

/// An order as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrder {
    /// Broker-side order id.
    pub id: String,
    /// Client order id echoed back.
    pub client_order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Requested quantity.
    pub qty: Decimal,
    /// Broker status string (e.g. "accepted", "partially_filled").
    pub status: String,
    /// Cumulative filled quantity.
    pub filled_qty: Decimal,
    /// Cumulative average fill price, when reported.
    pub filled_avg_price: Option<f64>,
    /// Creation time at the broker.
    pub created_at: Option<DateTime<Utc>>,
    /// Identifier of the most recent fill, when the broker reports one.
    pub fill_id: Option<String>,
}

/// A quote/trade snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Symbol.
    pub symbol: String,
    /// Last trade price.
    pub last_price: Option<f64>,
    /// Best bid.
    pub bid: Option<f64>,
    /// Best ask.
    pub ask: Option<f64>,
}

/// A historical bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    /// Bar timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Volume.
    pub volume: u64,
    /// Trade count, when the feed provides it.
    pub trade_count: Option<u64>,
    /// VWAP, when the feed provides it.
    pub vwap: Option<f64>,
}

/// Asset metadata from the broker's asset registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    /// Symbol.
    pub symbol: String,
    /// Whether the asset is tradable on this account.
    pub tradable: bool,
    /// Asset class reported by the broker ("us_equity", "crypto", ...).
    pub asset_class: String,
}

/// A new order submission.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Quantity.
    pub qty: Decimal,
    /// Deterministic client order id.
    pub client_order_id: String,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price; required iff `order_type` is limit.
    pub limit_price: Option<f64>,
    /// Time in force ("day", "gtc", ...).
    pub time_in_force: String,
}

impl NewOrder {
    /// Validate the limit-price contract.
    pub fn validate(&self) -> Result<(), BrokerError> {
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => Err(BrokerError::Fatal(
                "limit order requires limit_price".to_string(),
            )),
            (OrderType::Market, Some(_)) => Err(BrokerError::Fatal(
                "market order must not carry limit_price".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Brokerage operations consumed by the engine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Fetch the market clock.
    async fn get_clock(&self) -> Result<Clock, BrokerError>;

    /// Fetch account balances.
    async fn get_account(&self) -> Result<Account, BrokerError>;

    /// Fetch all open positions.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Fetch all open (non-terminal) orders.
    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Fetch a single order by broker id.
    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError>;

    /// Submit a new order. Never retried by the adapter.
    async fn submit_order(&self, order: &NewOrder) -> Result<BrokerOrder, BrokerError>;

    /// Cancel an order by broker id. Never retried by the adapter.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    /// Fetch recent equity bars for a batch of symbols.
    async fn get_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        start: DateTime<Utc>,
        limit: usize,
        feed: &str,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError>;

    /// Fetch recent crypto bars; the crypto endpoint takes no feed.
    async fn get_crypto_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        start: DateTime<Utc>,
        limit: usize,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError>;

    /// Fetch a quote snapshot for one symbol.
    async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, BrokerError>;

    /// Look up asset metadata (tradability).
    async fn get_asset(&self, symbol: &str) -> Result<Asset, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn classify_auth_message_is_fatal() {
        assert!(matches!(
            classify_error_message("401 authentication failed"),
            BrokerError::Fatal(_)
        ));
        assert!(matches!(
            classify_error_message("request forbidden by policy"),
            BrokerError::Fatal(_)
        ));
        assert!(matches!(
            classify_error_message("Invalid symbol XYZ"),
            BrokerError::Fatal(_)
        ));
    }

    #[test]
    fn classify_network_message_is_transient() {
        assert!(matches!(
            classify_error_message("connection reset by peer"),
            BrokerError::Transient(_)
        ));
        assert!(matches!(
            classify_error_message("upstream 502"),
            BrokerError::Transient(_)
        ));
    }

    #[test]
    fn transient_predicate() {
        assert!(BrokerError::Transient("x".into()).is_transient());
        assert!(BrokerError::Timeout {
            operation: "get_clock".into(),
            timeout_secs: 5
        }
        .is_transient());
        assert!(!BrokerError::Fatal("x".into()).is_transient());
        assert!(!BrokerError::MaxRetriesExceeded { attempts: 3 }.is_transient());
    }

    #[test]
    fn order_side_parse_normalizes() {
        assert_eq!(OrderSide::parse(" BUY "), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("Sell"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("hold"), None);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }

    #[test]
    fn limit_order_requires_price() {
        let mut order = NewOrder {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(1),
            client_order_id: "abc".to_string(),
            order_type: OrderType::Limit,
            limit_price: None,
            time_in_force: "day".to_string(),
        };
        assert!(order.validate().is_err());

        order.limit_price = Some(187.5);
        assert!(order.validate().is_ok());

        order.order_type = OrderType::Market;
        assert!(order.validate().is_err());

        order.limit_price = None;
        assert!(order.validate().is_ok());
    }
}
