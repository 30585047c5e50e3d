//! Signal generation: indicators, regime detection, SMA crossover.

pub mod indicators;
pub mod regime;
pub mod sma_crossover;

pub use regime::{Regime, RegimeDetector, RegimeScore, TrendDirection};
pub use sma_crossover::{SmaCrossover, REQUIRED_HISTORY, SMA_PAIRS};
