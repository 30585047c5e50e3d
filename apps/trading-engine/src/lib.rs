// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::too_many_lines,
        clippy::needless_pass_by_value
    )
)]

//! Trading Engine - Core Library
//!
//! An automated trading engine for the Alpaca brokerage. The engine:
//!
//! - polls market data and per-order status over REST (the streaming tier
//!   has connection limits), deduped by bar timestamp and cumulative fill
//!   quantity
//! - generates multi-timeframe SMA crossover signals weighted by a market
//!   regime detector
//! - enforces layered risk gates: safety (kill-switch, circuit breaker,
//!   market clock), session-aware limits, and soft filters
//! - submits orders idempotently through deterministic client order ids
//!   persisted before submission
//! - tracks positions with one-way trailing stops and evaluates exits with
//!   ATR-based or fixed-percentage thresholds
//! - reconciles local SQLite state against the broker at startup (refusing
//!   to start on divergence) and continuously at runtime (repairing stuck
//!   state, halting trading on discrepancies)
//!
//! # Architecture
//!
//! Independent tokio tasks (bar poller, order poller, exit manager,
//! reconciler, housekeeping) communicate through a bounded event bus with
//! a single consumer: the orchestrator's event processor is the only
//! component that drives strategy, risk, and order submission, which
//! serializes the trading decisions.

pub mod broker;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod exits;
pub mod housekeeping;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod orders;
pub mod positions;
pub mod reconcile;
pub mod risk;
pub mod store;
pub mod strategy;
pub mod util;

pub use broker::{Broker, BrokerError, OrderSide, OrderType};
pub use config::Config;
pub use error::EngineError;
pub use events::{Event, EventBus};
pub use orchestrator::Orchestrator;
pub use store::{schema::ensure_schema, StateStore};
