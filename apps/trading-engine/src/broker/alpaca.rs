//! Alpaca REST client.
//!
//! Single-attempt HTTP calls with error classification; timeouts, retries,
//! and caching live in [`super::adapter::BrokerAdapter`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    classify_error_message, Account, Asset, Bar, Broker, BrokerError, BrokerOrder, BrokerPosition,
    Clock, NewOrder, OrderSide, Snapshot,
};

/// Paper trading API base URL.
pub const PAPER_API_URL: &str = "https://paper-api.alpaca.markets";
/// Live trading API base URL.
pub const LIVE_API_URL: &str = "https://api.alpaca.markets";
/// Market data API base URL.
pub const DATA_API_URL: &str = "https://data.alpaca.markets";

/// Alpaca REST client.
#[derive(Debug, Clone)]
pub struct AlpacaClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    trading_base_url: String,
    data_base_url: String,
}

impl AlpacaClient {
    /// Create a client for the paper or live endpoint.
    pub fn new(api_key: &str, api_secret: &str, paper: bool) -> Result<Self, BrokerError> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(BrokerError::Fatal(
                "Alpaca credentials must not be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            trading_base_url: if paper { PAPER_API_URL } else { LIVE_API_URL }.to_string(),
            data_base_url: DATA_API_URL.to_string(),
        })
    }

    /// Override base URLs, for tests against a local server.
    #[must_use]
    pub fn with_base_urls(mut self, trading: &str, data: &str) -> Self {
        self.trading_base_url = trading.to_string();
        self.data_base_url = data.to_string();
        self
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, BrokerError> {
        let response = self
            .http
            .get(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode_response(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, BrokerError> {
        let response = self
            .http
            .post(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode_response(response).await
    }

    async fn delete(&self, url: String) -> Result<(), BrokerError> {
        let response = self
            .http
            .delete(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    async fn fetch_bars(
        &self,
        url: String,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        let response: ApiBarsResponse = self.get_json(url).await?;
        let mut out = HashMap::new();
        for (symbol, bars) in response.bars {
            let mut converted = Vec::with_capacity(bars.len());
            for bar in bars {
                converted.push(bar.into_bar()?);
            }
            out.insert(symbol, converted);
        }
        Ok(out)
    }
}

#[async_trait]
impl Broker for AlpacaClient {
    async fn get_clock(&self) -> Result<Clock, BrokerError> {
        let api: ApiClock = self
            .get_json(format!("{}/v2/clock", self.trading_base_url))
            .await?;
        Ok(Clock {
            is_open: api.is_open,
            next_open: parse_ts_opt(api.next_open.as_deref()),
            next_close: parse_ts_opt(api.next_close.as_deref()),
            timestamp: parse_ts_opt(Some(&api.timestamp)).unwrap_or_else(Utc::now),
        })
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        let api: ApiAccount = self
            .get_json(format!("{}/v2/account", self.trading_base_url))
            .await?;
        Ok(Account {
            equity: parse_f64(&api.equity, "equity")?,
            buying_power: parse_f64(&api.buying_power, "buying_power")?,
            cash: parse_f64(&api.cash, "cash")?,
            portfolio_value: parse_f64(&api.portfolio_value, "portfolio_value")?,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let api: Vec<ApiPosition> = self
            .get_json(format!("{}/v2/positions", self.trading_base_url))
            .await?;
        api.into_iter().map(ApiPosition::into_position).collect()
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let api: Vec<ApiOrder> = self
            .get_json(format!(
                "{}/v2/orders?status=open&limit=500",
                self.trading_base_url
            ))
            .await?;
        api.into_iter().map(ApiOrder::into_order).collect()
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let api: ApiOrder = self
            .get_json(format!(
                "{}/v2/orders/{broker_order_id}",
                self.trading_base_url
            ))
            .await?;
        api.into_order()
    }

    async fn submit_order(&self, order: &NewOrder) -> Result<BrokerOrder, BrokerError> {
        order.validate()?;
        let body = ApiOrderRequest {
            symbol: order.symbol.clone(),
            qty: order.qty.to_string(),
            side: order.side.as_str().to_string(),
            order_type: order.order_type.as_str().to_string(),
            time_in_force: order.time_in_force.clone(),
            limit_price: order.limit_price.map(|p| p.to_string()),
            client_order_id: Some(order.client_order_id.clone()),
        };
        let api: ApiOrder = self
            .post_json(format!("{}/v2/orders", self.trading_base_url), &body)
            .await?;
        api.into_order()
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.delete(format!(
            "{}/v2/orders/{broker_order_id}",
            self.trading_base_url
        ))
        .await
    }

    async fn get_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        start: DateTime<Utc>,
        limit: usize,
        feed: &str,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        let url = format!(
            "{}/v2/stocks/bars?symbols={}&timeframe={}&start={}&limit={}&feed={}",
            self.data_base_url,
            symbols.join(","),
            timeframe,
            start.to_rfc3339(),
            limit,
            feed,
        );
        self.fetch_bars(url).await
    }

    async fn get_crypto_bars(
        &self,
        symbols: &[String],
        timeframe: &str,
        start: DateTime<Utc>,
        limit: usize,
    ) -> Result<HashMap<String, Vec<Bar>>, BrokerError> {
        // Crypto endpoint takes no feed parameter.
        let url = format!(
            "{}/v1beta3/crypto/us/bars?symbols={}&timeframe={}&start={}&limit={}",
            self.data_base_url,
            symbols.join(","),
            timeframe,
            start.to_rfc3339(),
            limit,
        );
        self.fetch_bars(url).await
    }

    async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, BrokerError> {
        let api: ApiSnapshot = self
            .get_json(format!(
                "{}/v2/stocks/{symbol}/snapshot",
                self.data_base_url
            ))
            .await?;
        Ok(Snapshot {
            symbol: symbol.to_string(),
            last_price: api.latest_trade.and_then(|t| t.price),
            bid: api.latest_quote.as_ref().and_then(|q| q.bid_price),
            ask: api.latest_quote.as_ref().and_then(|q| q.ask_price),
        })
    }

    async fn get_asset(&self, symbol: &str) -> Result<Asset, BrokerError> {
        let api: ApiAsset = self
            .get_json(format!("{}/v2/assets/{symbol}", self.trading_base_url))
            .await?;
        Ok(Asset {
            symbol: api.symbol,
            tradable: api.tradable,
            asset_class: api.class,
        })
    }
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BrokerError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BrokerError::Transient(e.to_string()))?;
    if status.is_success() {
        serde_json::from_str(&body).map_err(|e| BrokerError::Parse(e.to_string()))
    } else {
        Err(classify_status(status, &body))
    }
}

fn classify_status(status: StatusCode, body: &str) -> BrokerError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string());
    match status.as_u16() {
        401 => BrokerError::Fatal(format!("authentication failed: {message}")),
        403 => BrokerError::Fatal(format!("forbidden: {message}")),
        404 => BrokerError::Fatal(format!("not found: {message}")),
        422 => BrokerError::Fatal(format!("invalid request: {message}")),
        429 => BrokerError::Transient(format!("rate limited: {message}")),
        408 | 500..=599 => BrokerError::Transient(format!("upstream {status}: {message}")),
        _ => classify_error_message(&format!("{status}: {message}")),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() || err.is_connect() {
        BrokerError::Transient(err.to_string())
    } else {
        classify_error_message(&err.to_string())
    }
}

fn parse_ts_opt(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, BrokerError> {
    raw.parse::<f64>()
        .map_err(|e| BrokerError::Parse(format!("{field}: {e}")))
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, BrokerError> {
    raw.parse::<Decimal>()
        .map_err(|e| BrokerError::Parse(format!("{field}: {e}")))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiClock {
    is_open: bool,
    #[serde(default)]
    next_open: Option<String>,
    #[serde(default)]
    next_close: Option<String>,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct ApiAccount {
    equity: String,
    buying_power: String,
    cash: String,
    portfolio_value: String,
}

#[derive(Debug, Deserialize)]
struct ApiPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    #[serde(default)]
    current_price: Option<String>,
}

impl ApiPosition {
    fn into_position(self) -> Result<BrokerPosition, BrokerError> {
        Ok(BrokerPosition {
            qty: parse_decimal(&self.qty, "qty")?,
            avg_entry_price: parse_f64(&self.avg_entry_price, "avg_entry_price")?,
            current_price: self.current_price.as_deref().and_then(|p| p.parse().ok()),
            symbol: self.symbol,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiOrder {
    id: String,
    client_order_id: String,
    symbol: String,
    #[serde(default)]
    qty: Option<String>,
    side: String,
    status: String,
    filled_qty: String,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

impl ApiOrder {
    fn into_order(self) -> Result<BrokerOrder, BrokerError> {
        let side = OrderSide::parse(&self.side)
            .ok_or_else(|| BrokerError::Parse(format!("unknown order side: {}", self.side)))?;
        Ok(BrokerOrder {
            qty: self
                .qty
                .as_deref()
                .map_or(Ok(Decimal::ZERO), |q| parse_decimal(q, "qty"))?,
            filled_qty: parse_decimal(&self.filled_qty, "filled_qty")?,
            filled_avg_price: self
                .filled_avg_price
                .as_deref()
                .and_then(|p| p.parse().ok()),
            created_at: parse_ts_opt(self.created_at.as_deref()),
            fill_id: None,
            id: self.id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            side,
            status: self.status.to_lowercase(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ApiOrderRequest {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiBarsResponse {
    #[serde(default)]
    bars: HashMap<String, Vec<ApiBar>>,
}

#[derive(Debug, Deserialize)]
struct ApiBar {
    t: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: u64,
    #[serde(default)]
    n: Option<u64>,
    #[serde(default)]
    vw: Option<f64>,
}

impl ApiBar {
    fn into_bar(self) -> Result<Bar, BrokerError> {
        let timestamp = parse_ts_opt(Some(&self.t))
            .ok_or_else(|| BrokerError::Parse(format!("bad bar timestamp: {}", self.t)))?;
        Ok(Bar {
            timestamp,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            trade_count: self.n,
            vwap: self.vw,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiSnapshot {
    #[serde(rename = "latestTrade", default)]
    latest_trade: Option<ApiTrade>,
    #[serde(rename = "latestQuote", default)]
    latest_quote: Option<ApiQuote>,
}

#[derive(Debug, Deserialize)]
struct ApiTrade {
    #[serde(rename = "p", default)]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiQuote {
    #[serde(rename = "bp", default)]
    bid_price: Option<f64>,
    #[serde(rename = "ap", default)]
    ask_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiAsset {
    symbol: String,
    tradable: bool,
    class: String,
}
