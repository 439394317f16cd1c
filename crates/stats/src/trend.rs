//! Trend and anomaly detection over metric time series.
//!
//! Outliers use the IQR fence on linearly interpolated quartiles. The trend
//! fit is ordinary least squares; its `is_significant` flag is only an R²
//! threshold, not a hypothesis test.

use experiment_core::{ExperimentError, ExperimentResult};
use serde::{Deserialize, Serialize};

/// Slopes smaller than this in magnitude are reported as stable.
const FLAT_SLOPE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierReport {
    pub outliers: Vec<f64>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub q1: f64,
    pub q3: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub direction: TrendDirection,
    pub is_significant: bool,
}

/// Percentile of already-sorted values, interpolating at index p·(n−1).
pub fn percentile(sorted: &[f64], p: f64) -> ExperimentResult<f64> {
    if sorted.is_empty() {
        return Err(ExperimentError::insufficient("percentile of an empty series"));
    }
    if !(0.0..=1.0).contains(&p) {
        return Err(ExperimentError::configuration(format!(
            "percentile must be within [0, 1], got {p}"
        )));
    }

    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Values outside [Q1 − k·IQR, Q3 + k·IQR].
pub fn detect_outliers(values: &[f64], iqr_multiplier: f64) -> ExperimentResult<OutlierReport> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ExperimentError::configuration("series contains non-finite values"));
    }
    if iqr_multiplier < 0.0 {
        return Err(ExperimentError::configuration(format!(
            "IQR multiplier must be non-negative, got {iqr_multiplier}"
        )));
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q1 = percentile(&sorted, 0.25)?;
    let q3 = percentile(&sorted, 0.75)?;
    let iqr = q3 - q1;
    let lower_bound = q1 - iqr_multiplier * iqr;
    let upper_bound = q3 + iqr_multiplier * iqr;

    let outliers = values
        .iter()
        .copied()
        .filter(|v| *v < lower_bound || *v > upper_bound)
        .collect();

    Ok(OutlierReport {
        outliers,
        lower_bound,
        upper_bound,
        q1,
        q3,
    })
}

/// Least-squares line of `values` against `time_points`.
pub fn detect_trend(
    values: &[f64],
    time_points: &[f64],
    r_squared_significance: f64,
) -> ExperimentResult<TrendReport> {
    if values.len() != time_points.len() {
        return Err(ExperimentError::configuration(format!(
            "{} values but {} time points",
            values.len(),
            time_points.len()
        )));
    }
    if values.len() < 2 {
        return Err(ExperimentError::insufficient("trend needs at least 2 points"));
    }

    let n = values.len() as f64;
    let mean_x = time_points.iter().sum::<f64>() / n;
    let mean_y = values.iter().sum::<f64>() / n;

    let (sxy, sxx) = time_points
        .iter()
        .zip(values)
        .fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
            (sxy + (x - mean_x) * (y - mean_y), sxx + (x - mean_x).powi(2))
        });

    if sxx == 0.0 {
        return Err(ExperimentError::insufficient(
            "time points have no spread; slope is undefined",
        ));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_total: f64 = values.iter().map(|y| (y - mean_y).powi(2)).sum();
    let ss_residual: f64 = time_points
        .iter()
        .zip(values)
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    let r_squared = if ss_total > 0.0 {
        (1.0 - ss_residual / ss_total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let direction = if slope > FLAT_SLOPE_EPSILON {
        TrendDirection::Increasing
    } else if slope < -FLAT_SLOPE_EPSILON {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    Ok(TrendReport {
        slope,
        intercept,
        r_squared,
        direction,
        is_significant: r_squared >= r_squared_significance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0];
        assert!((percentile(&sorted, 0.25).unwrap() - 2.25).abs() < 1e-12);
        assert!((percentile(&sorted, 0.75).unwrap() - 4.75).abs() < 1e-12);
        assert_eq!(percentile(&sorted, 0.0).unwrap(), 1.0);
        assert_eq!(percentile(&sorted, 1.0).unwrap(), 100.0);
        assert_eq!(percentile(&[7.0], 0.5).unwrap(), 7.0);
        assert!(percentile(&[], 0.5).is_err());
    }

    #[test]
    fn test_detect_outliers_flags_spike() {
        let report = detect_outliers(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0], 1.5).unwrap();
        assert_eq!(report.outliers, vec![100.0]);
        assert!((report.q1 - 2.25).abs() < 1e-12);
        assert!((report.q3 - 4.75).abs() < 1e-12);
        assert!((report.lower_bound - -1.5).abs() < 1e-12);
        assert!((report.upper_bound - 8.5).abs() < 1e-12);
    }

    #[test]
    fn test_detect_outliers_unsorted_input_and_low_side() {
        let report = detect_outliers(&[50.0, 52.0, -40.0, 51.0, 49.0, 53.0, 48.0], 1.5).unwrap();
        assert_eq!(report.outliers, vec![-40.0]);
    }

    #[test]
    fn test_detect_outliers_errors() {
        assert!(detect_outliers(&[], 1.5).is_err());
        assert!(detect_outliers(&[1.0, f64::NAN], 1.5).is_err());
        assert!(detect_outliers(&[1.0, 2.0], -1.0).is_err());
    }

    #[test]
    fn test_detect_trend_perfect_line() {
        let time = [0.0, 1.0, 2.0, 3.0, 4.0];
        let values = [1.0, 3.0, 5.0, 7.0, 9.0];
        let trend = detect_trend(&values, &time, 0.5).unwrap();
        assert!((trend.slope - 2.0).abs() < 1e-12);
        assert!((trend.intercept - 1.0).abs() < 1e-12);
        assert!((trend.r_squared - 1.0).abs() < 1e-12);
        assert_eq!(trend.direction, TrendDirection::Increasing);
        assert!(trend.is_significant);
    }

    #[test]
    fn test_detect_trend_decreasing_noisy() {
        let time = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let values = [10.0, 9.5, 8.0, 8.4, 6.1, 5.9];
        let trend = detect_trend(&values, &time, 0.5).unwrap();
        assert_eq!(trend.direction, TrendDirection::Decreasing);
        assert!(trend.r_squared > 0.8 && trend.r_squared < 1.0);
    }

    #[test]
    fn test_detect_trend_flat_series() {
        let trend = detect_trend(&[4.0, 4.0, 4.0], &[1.0, 2.0, 3.0], 0.5).unwrap();
        assert_eq!(trend.direction, TrendDirection::Stable);
        assert_eq!(trend.r_squared, 0.0);
        assert!(!trend.is_significant);
    }

    #[test]
    fn test_detect_trend_errors() {
        assert!(matches!(
            detect_trend(&[1.0, 2.0], &[1.0], 0.5),
            Err(ExperimentError::Configuration(_))
        ));
        assert!(matches!(
            detect_trend(&[1.0], &[1.0], 0.5),
            Err(ExperimentError::InsufficientData(_))
        ));
        assert!(matches!(
            detect_trend(&[1.0, 2.0], &[3.0, 3.0], 0.5),
            Err(ExperimentError::InsufficientData(_))
        ));
    }
}
