//! Plain-f64 indicator math: SMA and Wilder ATR.

use crate::broker::Bar;

/// Simple moving average of the last `period` values.
///
/// Returns `None` when there is not enough data or the period is zero.
#[must_use]
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// SMA at the previous and current bar, for crossover detection.
///
/// Needs `period + 1` values.
#[must_use]
pub fn sma_pair(values: &[f64], period: usize) -> Option<(f64, f64)> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let current = sma(values, period)?;
    let previous = sma(&values[..values.len() - 1], period)?;
    Some((previous, current))
}

/// Wilder-smoothed Average True Range over `period` bars.
#[must_use]
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for window in bars.windows(2) {
        let prev_close = window[0].close;
        let bar = &window[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }
    if true_ranges.len() < period {
        return None;
    }

    let mut value = true_ranges[..period].iter().sum::<f64>() / period as f64;
    for tr in &true_ranges[period..] {
        value = (value * (period - 1) as f64 + tr) / period as f64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 100,
            trade_count: None,
            vwap: None,
        }
    }

    #[test]
    fn sma_of_window() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&values, 5), Some(3.0));
        assert_eq!(sma(&values, 2), Some(4.5));
        assert_eq!(sma(&values, 6), None);
        assert_eq!(sma(&values, 0), None);
    }

    #[test]
    fn sma_pair_gives_prev_and_current() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let (prev, curr) = sma_pair(&values, 2).unwrap();
        assert_eq!(prev, 3.5);
        assert_eq!(curr, 4.5);
        assert!(sma_pair(&values, 5).is_none());
    }

    #[test]
    fn atr_of_constant_range_bars() {
        // High - low is always 2, closes constant: every TR is 2.
        let bars: Vec<Bar> = (0..20).map(|_| bar(101.0, 99.0, 100.0)).collect();
        let value = atr(&bars, 14).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_includes_gap_from_previous_close() {
        // A bar gapping far above the previous close widens the true range.
        let mut bars: Vec<Bar> = (0..15).map(|_| bar(101.0, 99.0, 100.0)).collect();
        bars.push(bar(121.0, 119.0, 120.0));
        let value = atr(&bars, 14).unwrap();
        assert!(value > 2.0);
    }

    #[test]
    fn atr_requires_enough_bars() {
        let bars: Vec<Bar> = (0..10).map(|_| bar(101.0, 99.0, 100.0)).collect();
        assert!(atr(&bars, 14).is_none());
    }
}
