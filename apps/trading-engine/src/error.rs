//! Top-level error type for the engine.
//!
//! Each subsystem owns its error enum (`StoreError`, `BrokerError`, ...);
//! this module folds them into the single flat sum type the orchestrator
//! surfaces. Configuration, schema, and reconciliation failures abort
//! startup; the rest are runtime errors the event processor logs and
//! survives.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::events::BusError;
use crate::orders::OrderError;
use crate::reconcile::ReconcileError;
use crate::risk::RiskError;
use crate::store::schema::SchemaError;
use crate::store::StoreError;

/// Engine-level error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration is invalid; startup refuses.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema migration failed; startup refuses.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// State store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Event bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Reconciliation found unresolved divergence.
    #[error(transparent)]
    Reconciliation(#[from] ReconcileError),

    /// Risk safety gate refused a signal.
    #[error(transparent)]
    Risk(#[from] RiskError),

    /// Order submission failed.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// A critical runtime task ended unexpectedly.
    #[error("Runtime failure: {0}")]
    Runtime(String),
}

impl EngineError {
    /// True when the error must abort startup rather than be retried.
    #[must_use]
    pub const fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Schema(_) | Self::Reconciliation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_is_startup_fatal() {
        let err = EngineError::Config("missing ALPACA_API_KEY".to_string());
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn broker_error_is_not_startup_fatal() {
        let err = EngineError::Broker(BrokerError::Transient("connection reset".to_string()));
        assert!(!err.is_startup_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = EngineError::Config("bad value".to_string());
        assert!(err.to_string().contains("bad value"));
    }
}
