//! Sample-size and power calculators for two-proportion tests.
//!
//! The minimum detectable effect is relative: a baseline of 0.10 with an
//! MDE of 0.20 targets a variant rate of 0.12.

use experiment_core::{ExperimentError, ExperimentResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distributions::{checked_probability, normal_cdf, normal_quantile};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleSizeEstimate {
    pub per_variant: u64,
    pub total: u64,
    pub num_variants: usize,
    /// Significance level after any multiple-comparison correction.
    pub adjusted_alpha: f64,
}

fn check_open_unit(value: f64, name: &str) -> ExperimentResult<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ExperimentError::configuration(format!(
            "{name} must be strictly between 0 and 1, got {value}"
        )))
    }
}

fn target_rate(baseline_rate: f64, minimum_detectable_effect: f64) -> ExperimentResult<f64> {
    check_open_unit(baseline_rate, "baseline rate")?;
    if !(minimum_detectable_effect > 0.0 && minimum_detectable_effect.is_finite()) {
        return Err(ExperimentError::configuration(format!(
            "minimum detectable effect must be positive, got {minimum_detectable_effect}"
        )));
    }
    let target = baseline_rate * (1.0 + minimum_detectable_effect);
    if target > 1.0 {
        return Err(ExperimentError::configuration(format!(
            "baseline {baseline_rate} lifted by {minimum_detectable_effect} exceeds a rate of 1"
        )));
    }
    Ok(target)
}

/// Per-variant sample size to detect a relative lift, always rounded up.
pub fn calculate_required_sample_size(
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    alpha: f64,
    power: f64,
) -> ExperimentResult<u64> {
    let p1 = baseline_rate;
    let p2 = target_rate(baseline_rate, minimum_detectable_effect)?;
    check_open_unit(alpha, "alpha")?;
    check_open_unit(power, "power")?;

    let z_alpha = normal_quantile(1.0 - alpha / 2.0)?;
    let z_beta = normal_quantile(power)?;
    let pooled = (p1 + p2) / 2.0;

    let numerator = z_alpha * (2.0 * pooled * (1.0 - pooled)).sqrt()
        + z_beta * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    let n = numerator.powi(2) / (p2 - p1).powi(2);

    debug!(baseline_rate, minimum_detectable_effect, alpha, power, n, "Required sample size");
    Ok(n.ceil() as u64)
}

/// Two-arm sample size: per variant and in total.
pub fn calculate_sample_size(
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    alpha: f64,
    power: f64,
) -> ExperimentResult<SampleSizeEstimate> {
    calculate_multi_variant_sample_size(baseline_rate, minimum_detectable_effect, alpha, power, 2)
}

/// Sample size for `num_variants` arms with a Bonferroni-adjusted alpha.
pub fn calculate_multi_variant_sample_size(
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    alpha: f64,
    power: f64,
    num_variants: usize,
) -> ExperimentResult<SampleSizeEstimate> {
    if num_variants < 2 {
        return Err(ExperimentError::configuration(format!(
            "an experiment needs at least 2 variants, got {num_variants}"
        )));
    }
    check_open_unit(alpha, "alpha")?;

    let adjusted_alpha = alpha / (num_variants - 1) as f64;
    let per_variant =
        calculate_required_sample_size(baseline_rate, minimum_detectable_effect, adjusted_alpha, power)?;

    Ok(SampleSizeEstimate {
        per_variant,
        total: per_variant * num_variants as u64,
        num_variants,
        adjusted_alpha,
    })
}

/// Achieved power for two observed (or hypothesised) rates at `n` per arm.
pub(crate) fn power_for_rates(
    p1: f64,
    p2: f64,
    sample_size_per_variant: u64,
    alpha: f64,
) -> ExperimentResult<f64> {
    if sample_size_per_variant == 0 {
        return Err(ExperimentError::insufficient(
            "power needs a non-zero sample size per variant",
        ));
    }
    check_open_unit(alpha, "alpha")?;

    let spread = (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    if spread == 0.0 {
        // Both arms deterministic: any difference is detected with certainty
        if p1 != p2 {
            return Ok(1.0);
        }
        return Err(ExperimentError::insufficient(
            "power is undefined when both rates are 0 or 1",
        ));
    }

    let z_alpha = normal_quantile(1.0 - alpha / 2.0)?;
    let pooled = (p1 + p2) / 2.0;
    let n = sample_size_per_variant as f64;
    let z_power = ((p2 - p1).abs() * n.sqrt() - z_alpha * (2.0 * pooled * (1.0 - pooled)).sqrt())
        / spread;

    checked_probability(normal_cdf(z_power), "power")
}

/// Power to detect a relative lift given the per-variant sample size.
pub fn calculate_power(
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    sample_size_per_variant: u64,
    alpha: f64,
) -> ExperimentResult<f64> {
    let p2 = target_rate(baseline_rate, minimum_detectable_effect)?;
    power_for_rates(baseline_rate, p2, sample_size_per_variant, alpha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_required_sample_size_known_case() {
        let n = calculate_required_sample_size(0.10, 0.20, 0.05, 0.8).unwrap();
        assert!((3_800..=3_880).contains(&n), "n = {n}");
    }

    #[test]
    fn test_sample_size_total_is_two_arms() {
        let estimate = calculate_sample_size(0.10, 0.20, 0.05, 0.8).unwrap();
        assert_eq!(estimate.total, estimate.per_variant * 2);
        assert_eq!(estimate.adjusted_alpha, 0.05);
    }

    #[test]
    fn test_multi_variant_applies_bonferroni() {
        let two = calculate_multi_variant_sample_size(0.10, 0.20, 0.05, 0.8, 2).unwrap();
        let four = calculate_multi_variant_sample_size(0.10, 0.20, 0.05, 0.8, 4).unwrap();
        assert!((four.adjusted_alpha - 0.05 / 3.0).abs() < 1e-12);
        assert!(four.per_variant > two.per_variant);
        assert_eq!(four.total, four.per_variant * 4);
        assert!(calculate_multi_variant_sample_size(0.10, 0.20, 0.05, 0.8, 1).is_err());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(calculate_required_sample_size(0.0, 0.2, 0.05, 0.8).is_err());
        assert!(calculate_required_sample_size(0.1, 0.0, 0.05, 0.8).is_err());
        assert!(calculate_required_sample_size(0.1, 0.2, 1.0, 0.8).is_err());
        assert!(calculate_required_sample_size(0.1, 0.2, 0.05, 0.0).is_err());
        // 0.6 * 2 exceeds a rate of 1
        assert!(calculate_required_sample_size(0.6, 1.0, 0.05, 0.8).is_err());
    }

    #[test]
    fn test_power_inverts_sample_size() {
        let n = calculate_required_sample_size(0.10, 0.20, 0.05, 0.8).unwrap();
        let power = calculate_power(0.10, 0.20, n, 0.05).unwrap();
        assert!((power - 0.8).abs() < 0.01, "power {power}");

        let low = calculate_power(0.10, 0.20, n / 4, 0.05).unwrap();
        assert!(low < power);
    }

    #[test]
    fn test_power_zero_sample_is_insufficient() {
        assert!(matches!(
            calculate_power(0.10, 0.20, 0, 0.05),
            Err(ExperimentError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_power_for_deterministic_rates() {
        assert_eq!(power_for_rates(0.0, 1.0, 100, 0.05).unwrap(), 1.0);
        assert!(matches!(
            power_for_rates(0.0, 0.0, 100, 0.05),
            Err(ExperimentError::InsufficientData(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_sample_size_decreases_with_mde(
            baseline in 0.05f64..0.3,
            mde in 0.05f64..0.8,
        ) {
            let smaller_effect = calculate_required_sample_size(baseline, mde, 0.05, 0.8).unwrap();
            let larger_effect = calculate_required_sample_size(baseline, mde * 1.5, 0.05, 0.8).unwrap();
            prop_assert!(larger_effect < smaller_effect);
        }
    }
}
