//! Multi-period SMA crossover strategy.
//!
//! Evaluates three SMA pairs per bar and emits up to one signal per pair.
//! Signals fire only on the crossover bar, and the per-(symbol, pair)
//! last-signal memory suppresses repeats in the same direction across
//! restarts.

use std::sync::Arc;

use crate::broker::Bar;
use crate::events::{SignalAction, SignalEvent, SignalMetadata};
use crate::store::{StateStore, StoreError};

use super::indicators::{atr, sma_pair};
use super::regime::{Regime, RegimeDetector, RegimeScore};

/// The SMA pairs evaluated on every bar.
pub const SMA_PAIRS: [(usize, usize); 3] = [(5, 15), (10, 30), (20, 50)];

/// Bars required before the strategy will evaluate a symbol: the slowest
/// SMA plus one closed bar for crossover detection.
pub const REQUIRED_HISTORY: usize = 51;

/// Multi-period SMA crossover with regime-weighted confidence.
pub struct SmaCrossover {
    store: Arc<StateStore>,
    detector: RegimeDetector,
    name: String,
}

impl SmaCrossover {
    /// Create the strategy.
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            detector: RegimeDetector,
            name: "sma_crossover".to_string(),
        }
    }

    /// Strategy name, used for order-id and gate namespacing.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minimum bars of history required.
    #[must_use]
    pub const fn required_history(&self) -> usize {
        REQUIRED_HISTORY
    }

    /// Evaluate a bar series; emits zero to three signals.
    pub fn on_bar(&self, symbol: &str, bars: &[Bar]) -> Result<Vec<SignalEvent>, StoreError> {
        if bars.len() < REQUIRED_HISTORY {
            return Ok(Vec::new());
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let regime = self.detector.detect(bars);
        let atr_14 = atr(bars, 14);
        let last_bar = &bars[bars.len() - 1];

        let mut signals = Vec::new();
        for pair in SMA_PAIRS {
            let (fast, slow) = pair;
            let Some((fast_prev, fast_curr)) = sma_pair(&closes, fast) else {
                continue;
            };
            let Some((slow_prev, slow_curr)) = sma_pair(&closes, slow) else {
                continue;
            };

            let action = if fast_prev <= slow_prev && fast_curr > slow_curr {
                SignalAction::Buy
            } else if fast_prev >= slow_prev && fast_curr < slow_curr {
                SignalAction::Sell
            } else {
                continue;
            };

            // Suppress a repeat in the same direction for this pair.
            let last = self.store.get_last_signal(symbol, pair)?;
            if last.as_deref() == Some(action.as_str()) {
                tracing::debug!(
                    symbol,
                    pair = ?pair,
                    action = action.as_str(),
                    "Crossover suppressed by last-signal memory"
                );
                continue;
            }

            self.store.save_last_signal(symbol, action.as_str(), pair)?;

            let confidence = confidence_for(pair, &regime);
            tracing::info!(
                symbol,
                action = action.as_str(),
                fast,
                slow,
                confidence,
                regime = regime.regime.as_str(),
                "Crossover signal"
            );
            signals.push(SignalEvent {
                symbol: symbol.to_string(),
                action,
                timestamp: last_bar.timestamp,
                metadata: SignalMetadata {
                    sma_period: pair,
                    confidence,
                    regime: regime.regime,
                    atr: atr_14,
                    regime_strength: Some(regime.strength),
                },
            });
        }
        Ok(signals)
    }
}

/// Confidence per (pair, regime): slower pairs are trusted more in trends,
/// everything is discounted in ranges, transitional regimes sit at the
/// filter threshold.
fn confidence_for(pair: (usize, usize), regime: &RegimeScore) -> f64 {
    match (pair, regime.regime) {
        ((20, 50), Regime::Trending) => 0.9,
        ((10, 30), Regime::Trending) => 0.7,
        ((5, 15), Regime::Trending) => 0.6,
        ((20, 50) | (10, 30), Regime::Ranging) => 0.4,
        ((5, 15), Regime::Ranging) => 0.3,
        _ => 0.5,
    }
}
