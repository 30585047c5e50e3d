//! Small shared helpers used across the engine.

/// Coerce a DB or metadata value to a finite `f64`, or `None`.
///
/// NaN and infinities are clamped to `None` so that optional numeric columns
/// read back as "absent" rather than poisoning downstream arithmetic.
#[must_use]
pub fn parse_optional_f64(value: Option<&str>) -> Option<f64> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// Clamp an already-parsed float to `None` unless it is finite.
#[must_use]
pub fn finite_or_none(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Split a slice into batches of at most `batch_size` items.
///
/// A `batch_size` of zero yields no batches; the final batch may be smaller.
pub fn batch_chunks<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    if batch_size == 0 {
        return Vec::new();
    }
    items.chunks(batch_size).map(<[T]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_optional_f64_accepts_finite() {
        assert_eq!(parse_optional_f64(Some("1.25")), Some(1.25));
        assert_eq!(parse_optional_f64(Some(" 3 ")), Some(3.0));
    }

    #[test]
    fn parse_optional_f64_rejects_non_finite() {
        assert_eq!(parse_optional_f64(Some("NaN")), None);
        assert_eq!(parse_optional_f64(Some("inf")), None);
        assert_eq!(parse_optional_f64(Some("-inf")), None);
    }

    #[test]
    fn parse_optional_f64_rejects_garbage() {
        assert_eq!(parse_optional_f64(Some("abc")), None);
        assert_eq!(parse_optional_f64(Some("")), None);
        assert_eq!(parse_optional_f64(None), None);
    }

    #[test]
    fn finite_or_none_clamps() {
        assert_eq!(finite_or_none(Some(2.0)), Some(2.0));
        assert_eq!(finite_or_none(Some(f64::NAN)), None);
        assert_eq!(finite_or_none(Some(f64::INFINITY)), None);
        assert_eq!(finite_or_none(None), None);
    }

    #[test]
    fn batch_chunks_splits_with_remainder() {
        let batches = batch_chunks(&[1, 2, 3, 4, 5], 2);
        assert_eq!(batches, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn batch_chunks_zero_size_is_empty() {
        let batches = batch_chunks(&[1, 2, 3], 0);
        assert!(batches.is_empty());
    }

    #[test]
    fn batch_chunks_empty_input() {
        let batches: Vec<Vec<i32>> = batch_chunks(&[], 3);
        assert!(batches.is_empty());
    }
}
