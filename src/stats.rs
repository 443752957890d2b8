//! Shared statistical primitives
//!
//! Every aggregate in this engine follows the same null convention: an
//! aggregate over zero values is `None`, never zero. Variability is always
//! the population standard deviation (divide by N).

/// Sum of values; `None` when there are no values
pub fn sum(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum())
}

/// Arithmetic mean; `None` when there are no values
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation; `None` when there are no values
pub fn stddev_pop(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Median as the lower-middle element of the sorted values; `None` when
/// there are no values. Matches approximate-percentile semantics for the
/// 0.5 quantile: the result is always an observed value.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[(sorted.len() - 1) / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_aggregates_are_none() {
        assert_eq!(sum(&[]), None);
        assert_eq!(mean(&[]), None);
        assert_eq!(stddev_pop(&[]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_mean_and_sum() {
        let values = [2.0, 4.0, 6.0];
        assert_eq!(sum(&values), Some(12.0));
        assert_eq!(mean(&values), Some(4.0));
    }

    #[test]
    fn test_stddev_is_population() {
        // Population stddev of [2, 4]: sqrt(((2-3)^2 + (4-3)^2) / 2) = 1.0
        let result = stddev_pop(&[2.0, 4.0]).unwrap();
        assert!((result - 1.0).abs() < 1e-12);

        // A single value has zero spread, not a missing one
        assert_eq!(stddev_pop(&[5.0]), Some(0.0));
    }

    #[test]
    fn test_median_picks_observed_value() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        // Even count: the lower-middle element
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.0));
    }
}
