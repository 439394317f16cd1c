//! Special functions and distribution CDFs used by the test procedures.

use experiment_core::{ExperimentError, ExperimentResult};
use tracing::debug;

/// z used when a confidence level is not in the lookup table.
pub const DEFAULT_Z_SCORE: f64 = 1.96;

const Z_SCORES: [(f64, f64); 8] = [
    (0.80, 1.2816),
    (0.85, 1.4395),
    (0.90, 1.6449),
    (0.95, 1.96),
    (0.98, 2.3263),
    (0.99, 2.5758),
    (0.995, 2.8070),
    (0.999, 3.2905),
];

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Above this statistic (or degrees of freedom) the chi-square CDF switches
/// from the incomplete-gamma series to the Wilson-Hilferty approximation.
const CHI_SQUARE_SERIES_MAX_X: f64 = 100.0;
const CHI_SQUARE_SERIES_MAX_DF: f64 = 200.0;
const SERIES_MAX_TERMS: usize = 1_000;
const SERIES_EPSILON: f64 = 1e-14;

/// Error function approximation (Abramowitz & Stegun 7.1.26, |ε| ≤ 1.5e-7).
pub fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x >= 0.0 { 1.0 } else { -1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    (0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))).clamp(0.0, 1.0)
}

/// Standard normal quantile (Abramowitz & Stegun 26.2.23).
pub fn normal_quantile(p: f64) -> ExperimentResult<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(ExperimentError::configuration(format!(
            "normal quantile requires 0 < p < 1, got {p}"
        )));
    }

    let sign = if p < 0.5 { -1.0 } else { 1.0 };
    let tail = if p < 0.5 { p } else { 1.0 - p };
    let t = (-2.0 * tail.ln()).sqrt();

    let c0 = 2.515517;
    let c1 = 0.802853;
    let c2 = 0.010328;
    let d1 = 1.432788;
    let d2 = 0.189269;
    let d3 = 0.001308;

    let x = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);
    Ok(sign * x)
}

/// Two-sided critical z for a confidence level. Unknown levels fall back
/// to [`DEFAULT_Z_SCORE`].
pub fn z_score(confidence_level: f64) -> f64 {
    Z_SCORES
        .iter()
        .find(|(level, _)| (level - confidence_level).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or_else(|| {
            debug!(confidence_level, "No z-score entry, using 1.96");
            DEFAULT_Z_SCORE
        })
}

/// Gamma function via the Lanczos approximation (g = 7, 9 terms), with the
/// reflection formula below 0.5.
pub fn gamma(x: f64) -> f64 {
    use std::f64::consts::PI;

    if x < 0.5 {
        return PI / ((PI * x).sin() * gamma(1.0 - x));
    }

    let x = x - 1.0;
    let t = x + LANCZOS_G + 0.5;
    let series = LANCZOS_COEFFICIENTS
        .iter()
        .enumerate()
        .skip(1)
        .fold(LANCZOS_COEFFICIENTS[0], |acc, (i, c)| acc + c / (x + i as f64));

    (2.0 * PI).sqrt() * t.powf(x + 0.5) * (-t).exp() * series
}

/// Regularized lower incomplete gamma P(a, x) by its power series.
fn lower_regularized_gamma(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }

    let mut term = 1.0;
    let mut sum = 1.0;
    for n in 1..SERIES_MAX_TERMS {
        term *= x / (a + n as f64);
        sum += term;
        if term < sum * SERIES_EPSILON {
            break;
        }
    }

    ((a * x.ln() - x).exp() / gamma(a + 1.0) * sum).clamp(0.0, 1.0)
}

/// Chi-square CDF with `df` degrees of freedom.
pub fn chi_square_cdf(x: f64, df: f64) -> ExperimentResult<f64> {
    if df <= 0.0 || !df.is_finite() {
        return Err(ExperimentError::configuration(format!(
            "chi-square degrees of freedom must be positive, got {df}"
        )));
    }
    if x.is_nan() {
        return Err(ExperimentError::insufficient("chi-square statistic is NaN"));
    }
    if x <= 0.0 {
        return Ok(0.0);
    }

    if x <= CHI_SQUARE_SERIES_MAX_X && df <= CHI_SQUARE_SERIES_MAX_DF {
        return Ok(lower_regularized_gamma(df / 2.0, x / 2.0));
    }

    // Wilson-Hilferty: (X/k)^(1/3) is approximately normal.
    let variance = 2.0 / (9.0 * df);
    let z = ((x / df).cbrt() - (1.0 - variance)) / variance.sqrt();
    Ok(normal_cdf(z))
}

/// Checks a computed probability into [0, 1] before it is handed out.
pub(crate) fn checked_probability(value: f64, what: &str) -> ExperimentResult<f64> {
    if !value.is_finite() {
        return Err(ExperimentError::insufficient(format!("{what} is not finite")));
    }
    if !(-1e-9..=1.0 + 1e-9).contains(&value) {
        return Err(ExperimentError::Internal(anyhow::anyhow!(
            "{what} {value} fell outside [0, 1]"
        )));
    }
    Ok(value.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erf_known_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.842_700_79).abs() < 2e-7);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 2e-7);
        assert!((erf(3.0) - 0.999_977_91).abs() < 2e-7);
    }

    #[test]
    fn test_normal_cdf() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-4);
    }

    #[test]
    fn test_normal_quantile() {
        assert!((normal_quantile(0.975).unwrap() - 1.96).abs() < 1e-3);
        assert!((normal_quantile(0.8).unwrap() - 0.8416).abs() < 1e-3);
        assert!((normal_quantile(0.025).unwrap() + 1.96).abs() < 1e-3);
        assert!(normal_quantile(0.0).is_err());
        assert!(normal_quantile(1.0).is_err());
    }

    #[test]
    fn test_z_score_lookup_and_fallback() {
        assert_eq!(z_score(0.95), 1.96);
        assert_eq!(z_score(0.99), 2.5758);
        assert_eq!(z_score(0.90), 1.6449);
        assert_eq!(z_score(0.42), DEFAULT_Z_SCORE);
    }

    #[test]
    fn test_gamma_function() {
        assert!((gamma(1.0) - 1.0).abs() < 1e-10);
        assert!((gamma(5.0) - 24.0).abs() < 1e-8);
        assert!((gamma(0.5) - std::f64::consts::PI.sqrt()).abs() < 1e-10);
        // Reflection branch
        assert!((gamma(0.25) - 3.625_609_908_221_908).abs() < 1e-9);
        assert!((gamma(-0.5) + 2.0 * std::f64::consts::PI.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_chi_square_cdf_small_regime() {
        // df = 1 critical value at alpha 0.05
        assert!((chi_square_cdf(3.841_458_8, 1.0).unwrap() - 0.95).abs() < 1e-6);
        // df = 2 has a closed form: 1 - exp(-x/2)
        let x = 4.0_f64;
        assert!((chi_square_cdf(x, 2.0).unwrap() - (1.0 - (-x / 2.0).exp())).abs() < 1e-9);
        assert_eq!(chi_square_cdf(0.0, 3.0).unwrap(), 0.0);
    }

    #[test]
    fn test_chi_square_cdf_large_regime() {
        // Wilson-Hilferty at the df = 300 median-ish point
        let cdf = chi_square_cdf(299.33, 300.0).unwrap();
        assert!((cdf - 0.5).abs() < 0.01);
        assert!(chi_square_cdf(500.0, 1.0).unwrap() > 0.999_999);
    }

    #[test]
    fn test_chi_square_cdf_rejects_bad_df() {
        assert!(chi_square_cdf(1.0, 0.0).is_err());
    }

    #[test]
    fn test_checked_probability() {
        assert_eq!(checked_probability(1.0 + 1e-12, "p").unwrap(), 1.0);
        assert!(checked_probability(f64::NAN, "p").is_err());
        assert!(checked_probability(1.5, "p").is_err());
    }
}
