//! Market regime detection: trending vs ranging.

use crate::broker::Bar;

use super::indicators::{atr, sma};

/// Regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Price is trending away from its slow mean.
    Trending,
    /// Price is oscillating around its slow mean.
    Ranging,
    /// Transitional or not enough data.
    Unknown,
}

impl Regime {
    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Unknown => "unknown",
        }
    }
}

/// Trend direction when trending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    /// Price above the slow mean.
    Up,
    /// Price below the slow mean.
    Down,
    /// Not trending.
    None,
}

/// Regime analysis result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeScore {
    /// Classification.
    pub regime: Regime,
    /// Confidence in the classification, 0-1.
    pub confidence: f64,
    /// Trend direction.
    pub direction: TrendDirection,
    /// Normalized trend strength, 0-1.
    pub strength: f64,
}

impl RegimeScore {
    const fn unknown() -> Self {
        Self {
            regime: Regime::Unknown,
            confidence: 0.0,
            direction: TrendDirection::None,
            strength: 0.0,
        }
    }
}

/// Classifies recent price action on the most recent closed bar.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegimeDetector;

impl RegimeDetector {
    /// Analyze a bar series.
    ///
    /// Trend strength is the distance of the close from SMA(50) in ATR(14)
    /// units: above 1.5 is a strong trend, above 0.8 a weak one, below 0.5
    /// a range.
    #[must_use]
    pub fn detect(&self, bars: &[Bar]) -> RegimeScore {
        if bars.len() < 50 {
            return RegimeScore::unknown();
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let (Some(sma_50), Some(atr_14)) = (sma(&closes, 50), atr(bars, 14)) else {
            return RegimeScore::unknown();
        };
        if atr_14 <= 0.0 {
            return RegimeScore::unknown();
        }

        let close = closes[closes.len() - 1];
        let distance = close - sma_50;
        let trend_strength = distance.abs() / atr_14;
        let normalized = (trend_strength / 2.0).min(1.0);
        let direction = if distance > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        };

        if trend_strength > 1.5 {
            RegimeScore {
                regime: Regime::Trending,
                confidence: 0.9,
                direction,
                strength: normalized,
            }
        } else if trend_strength > 0.8 {
            RegimeScore {
                regime: Regime::Trending,
                confidence: 0.6,
                direction,
                strength: normalized,
            }
        } else if trend_strength < 0.5 {
            RegimeScore {
                regime: Regime::Ranging,
                confidence: 0.8,
                direction: TrendDirection::None,
                strength: 0.0,
            }
        } else {
            RegimeScore {
                regime: Regime::Unknown,
                confidence: 0.5,
                direction: TrendDirection::None,
                strength: normalized,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn series(closes: &[f64]) -> Vec<Bar> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 100,
                trade_count: Some(50),
                vwap: None,
            })
            .collect()
    }

    #[test]
    fn too_short_series_is_unknown() {
        let bars = series(&vec![100.0; 40]);
        let score = RegimeDetector.detect(&bars);
        assert_eq!(score.regime, Regime::Unknown);
        assert_eq!(score.confidence, 0.0);
    }

    #[test]
    fn strong_uptrend_detected() {
        // Steady +1/bar climb: distance from SMA(50) dwarfs the ATR.
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let score = RegimeDetector.detect(&series(&closes));
        assert_eq!(score.regime, Regime::Trending);
        assert_eq!(score.confidence, 0.9);
        assert_eq!(score.direction, TrendDirection::Up);
        assert!(score.strength > 0.9);
    }

    #[test]
    fn strong_downtrend_points_down() {
        let closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let score = RegimeDetector.detect(&series(&closes));
        assert_eq!(score.regime, Regime::Trending);
        assert_eq!(score.direction, TrendDirection::Down);
    }

    #[test]
    fn flat_series_is_ranging() {
        let score = RegimeDetector.detect(&series(&vec![100.0; 60]));
        assert_eq!(score.regime, Regime::Ranging);
        assert_eq!(score.confidence, 0.8);
        assert_eq!(score.direction, TrendDirection::None);
        assert_eq!(score.strength, 0.0);
    }
}
