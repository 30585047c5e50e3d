//! Runtime counters for monitoring without log analysis.
//!
//! One instance is owned by the orchestrator and handed to components by
//! `Arc`; there is no process-wide mutable singleton.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::json;

/// Engine-wide counters.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Signals emitted by the strategy.
    pub signals_generated: AtomicU64,
    /// Signals dropped by the confidence filter.
    pub signals_filtered_confidence: AtomicU64,
    /// Signals refused or skipped by risk gates.
    pub signals_filtered_risk: AtomicU64,
    /// Orders submitted to the broker.
    pub orders_submitted: AtomicU64,
    /// Orders observed filled.
    pub orders_filled: AtomicU64,
    /// Orders observed rejected.
    pub orders_rejected: AtomicU64,
    /// Exit signals acted on.
    pub exits_triggered: AtomicU64,
    /// Events dropped by the bus on overflow.
    pub events_dropped: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            signals_generated: AtomicU64::new(0),
            signals_filtered_confidence: AtomicU64::new(0),
            signals_filtered_risk: AtomicU64::new(0),
            orders_submitted: AtomicU64::new(0),
            orders_filled: AtomicU64::new(0),
            orders_rejected: AtomicU64::new(0),
            exits_triggered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }
}

impl EngineMetrics {
    /// Fresh metrics stamped with the start time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// JSON snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        let filtered_confidence = self.signals_filtered_confidence.load(Ordering::Relaxed);
        let filtered_risk = self.signals_filtered_risk.load(Ordering::Relaxed);
        json!({
            "counters": {
                "signals_generated": self.signals_generated.load(Ordering::Relaxed),
                "signals_filtered": filtered_confidence + filtered_risk,
                "signals_filtered_confidence": filtered_confidence,
                "signals_filtered_risk": filtered_risk,
                "orders_submitted": self.orders_submitted.load(Ordering::Relaxed),
                "orders_filled": self.orders_filled.load(Ordering::Relaxed),
                "orders_rejected": self.orders_rejected.load(Ordering::Relaxed),
                "exits_triggered": self.exits_triggered.load(Ordering::Relaxed),
                "events_dropped": self.events_dropped.load(Ordering::Relaxed),
            },
            "started_at": self.started_at.to_rfc3339(),
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
        })
    }
}
