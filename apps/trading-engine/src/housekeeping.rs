//! Periodic maintenance: equity-curve snapshots and the 09:30 ET daily
//! counter reset.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::America::New_York;

use crate::broker::Broker;
use crate::store::{StateStore, StoreError};

/// Seconds between housekeeping ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic maintenance tasks.
pub struct Housekeeping {
    broker: Arc<dyn Broker>,
    store: Arc<StateStore>,
}

impl Housekeeping {
    /// Create the housekeeping task.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, store: Arc<StateStore>) -> Self {
        Self { broker, store }
    }

    /// Record one equity-curve point.
    pub async fn snapshot_equity(&self) -> Result<(), StoreError> {
        let account = match self.broker.get_account().await {
            Ok(account) => account,
            Err(err) => {
                tracing::warn!(error = %err, "Equity snapshot skipped: account fetch failed");
                return Ok(());
            }
        };
        let daily_pnl = self.store.get_daily_pnl()?;
        self.store.append_equity_curve(account.equity, daily_pnl)?;
        tracing::debug!(equity = account.equity, "Equity snapshot");
        Ok(())
    }

    /// Reset daily counters at 09:30 ET, once per calendar day.
    ///
    /// Returns true when a reset was performed.
    pub fn maybe_reset_daily(&self, now_utc: DateTime<Utc>) -> Result<bool, StoreError> {
        let now_et = now_utc.with_timezone(&New_York);
        if now_et.hour() != 9 || now_et.minute() < 30 {
            return Ok(false);
        }
        let today = now_et.date_naive().to_string();
        if self.store.get_state("daily_reset_date")?.as_deref() == Some(today.as_str()) {
            return Ok(false);
        }

        tracing::info!(date = today, "Daily reset at 09:30 ET");
        self.store.reset_daily_state()?;
        self.store.set_state("daily_reset_date", &today)?;
        Ok(true)
    }

    /// Maintenance loop.
    pub async fn run(self: Arc<Self>) {
        tracing::info!("Housekeeping started");
        loop {
            if let Err(err) = self.snapshot_equity().await {
                tracing::error!(error = %err, "Equity snapshot failed");
            }
            if let Err(err) = self.maybe_reset_daily(Utc::now()) {
                tracing::error!(error = %err, "Daily reset failed");
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockBroker;
    use crate::store::testing::temp_store;
    use chrono::TimeZone;

    fn fixture() -> (tempfile::TempDir, Arc<MockBroker>, Arc<StateStore>, Housekeeping) {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let broker = Arc::new(MockBroker::new());
        let housekeeping = Housekeeping::new(broker.clone(), store.clone());
        (dir, broker, store, housekeeping)
    }

    #[tokio::test]
    async fn equity_snapshot_appends_row() {
        let (_dir, _broker, store, housekeeping) = fixture();
        store.save_daily_pnl(-42.0).unwrap();
        housekeeping.snapshot_equity().await.unwrap();
        assert_eq!(store.equity_curve_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn equity_snapshot_tolerates_broker_failure() {
        let (_dir, broker, store, housekeeping) = fixture();
        broker.push_failure(
            "get_account",
            crate::broker::BrokerError::Transient("down".to_string()),
        );
        housekeeping.snapshot_equity().await.unwrap();
        assert_eq!(store.equity_curve_count().unwrap(), 0);
    }

    #[test]
    fn daily_reset_fires_once_at_open() {
        let (_dir, _broker, store, housekeeping) = fixture();
        store.save_daily_pnl(-500.0).unwrap();
        store.save_daily_trade_count(9).unwrap();
        store.save_circuit_breaker_count(2).unwrap();

        // 2026-07-15 09:30 ET == 13:30 UTC (EDT).
        let open = Utc.with_ymd_and_hms(2026, 7, 15, 13, 30, 0).unwrap();
        assert!(housekeeping.maybe_reset_daily(open).unwrap());
        assert_eq!(store.get_daily_trade_count().unwrap(), 0);
        assert!((store.get_daily_pnl().unwrap()).abs() < f64::EPSILON);
        // The circuit-breaker count is untouched by the daily reset.
        assert_eq!(store.get_circuit_breaker_count().unwrap(), 2);

        // Same day, later in the 09:xx window: no second reset.
        let later = Utc.with_ymd_and_hms(2026, 7, 15, 13, 45, 0).unwrap();
        assert!(!housekeeping.maybe_reset_daily(later).unwrap());

        // Next day fires again.
        let next_day = Utc.with_ymd_and_hms(2026, 7, 16, 13, 31, 0).unwrap();
        assert!(housekeeping.maybe_reset_daily(next_day).unwrap());
    }

    #[test]
    fn no_reset_before_open() {
        let (_dir, _broker, _store, housekeeping) = fixture();
        // 09:29 ET == 13:29 UTC in July.
        let before = Utc.with_ymd_and_hms(2026, 7, 15, 13, 29, 0).unwrap();
        assert!(!housekeeping.maybe_reset_daily(before).unwrap());
        // Noon ET is outside the 09:xx reset window.
        let noon = Utc.with_ymd_and_hms(2026, 7, 15, 16, 0, 0).unwrap();
        assert!(!housekeeping.maybe_reset_daily(noon).unwrap());
    }
}
