//! Frequentist comparison of two conversion rates.

use experiment_core::types::VariantCounts;
use experiment_core::{ExperimentError, ExperimentResult};
use serde::{Deserialize, Serialize};

use crate::distributions::{checked_probability, normal_cdf, z_score};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZTest {
    pub z_score: f64,
    pub pooled_rate: f64,
    pub standard_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

pub(crate) fn observed_rate(counts: &VariantCounts) -> ExperimentResult<f64> {
    if counts.conversions > counts.sample_size {
        return Err(ExperimentError::configuration(format!(
            "variant `{}` has {} conversions out of {} samples",
            counts.variant_id, counts.conversions, counts.sample_size
        )));
    }
    counts.rate().ok_or_else(|| {
        ExperimentError::insufficient(format!("variant `{}` has no samples", counts.variant_id))
    })
}

/// Pooled two-proportion z-test of variant against control.
pub fn two_proportion_z_test(
    control: &VariantCounts,
    variant: &VariantCounts,
) -> ExperimentResult<ZTest> {
    let control_rate = observed_rate(control)?;
    let variant_rate = observed_rate(variant)?;

    let n_control = control.sample_size as f64;
    let n_variant = variant.sample_size as f64;
    let pooled_rate = (control.conversions + variant.conversions) as f64 / (n_control + n_variant);
    let standard_error =
        (pooled_rate * (1.0 - pooled_rate) * (1.0 / n_control + 1.0 / n_variant)).sqrt();

    if standard_error == 0.0 {
        return Err(ExperimentError::insufficient(
            "standard error is zero; both arms have identical all-or-nothing outcomes",
        ));
    }

    Ok(ZTest {
        z_score: (variant_rate - control_rate) / standard_error,
        pooled_rate,
        standard_error,
    })
}

/// Two-tailed p-value for a z statistic.
pub fn calculate_p_value(z: f64) -> ExperimentResult<f64> {
    if z.is_nan() {
        return Err(ExperimentError::insufficient("z statistic is NaN"));
    }
    checked_probability(2.0 * (1.0 - normal_cdf(z.abs())), "p-value")
}

pub fn is_significant(p_value: f64, confidence_level: f64) -> bool {
    p_value < 1.0 - confidence_level
}

/// Normal-approximation interval for a single proportion, clamped to [0, 1].
pub fn confidence_interval(
    rate: f64,
    sample_size: u64,
    confidence_level: f64,
) -> ExperimentResult<ConfidenceInterval> {
    if sample_size == 0 {
        return Err(ExperimentError::insufficient(
            "confidence interval needs a non-zero sample size",
        ));
    }
    if !(0.0..=1.0).contains(&rate) {
        return Err(ExperimentError::configuration(format!(
            "rate {rate} is not a proportion"
        )));
    }

    let margin = z_score(confidence_level) * (rate * (1.0 - rate) / sample_size as f64).sqrt();
    Ok(ConfidenceInterval {
        lower: (rate - margin).clamp(0.0, 1.0),
        upper: (rate + margin).clamp(0.0, 1.0),
    })
}

/// Cohen's h between two proportions.
pub fn effect_size(control_rate: f64, variant_rate: f64) -> ExperimentResult<f64> {
    for rate in [control_rate, variant_rate] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ExperimentError::configuration(format!(
                "rate {rate} is not a proportion"
            )));
        }
    }
    Ok((2.0 * variant_rate.sqrt().asin() - 2.0 * control_rate.sqrt().asin()).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_z_test_known_case() {
        // 10% vs 12% on 10k each
        let control = VariantCounts::new("control", 10_000, 1_000);
        let variant = VariantCounts::new("treatment", 10_000, 1_200);
        let test = two_proportion_z_test(&control, &variant).unwrap();

        assert!((test.pooled_rate - 0.11).abs() < 1e-12);
        let expected_se = (0.11_f64 * 0.89 * (2.0 / 10_000.0)).sqrt();
        assert!((test.standard_error - expected_se).abs() < 1e-12);
        assert!((test.z_score - 0.02 / expected_se).abs() < 1e-9);

        let p = calculate_p_value(test.z_score).unwrap();
        assert!(p < 0.001);
        assert!(is_significant(p, 0.95));
    }

    #[test]
    fn test_z_test_negative_direction() {
        let control = VariantCounts::new("control", 1_000, 200);
        let variant = VariantCounts::new("treatment", 1_000, 150);
        let test = two_proportion_z_test(&control, &variant).unwrap();
        assert!(test.z_score < 0.0);
    }

    #[test]
    fn test_z_test_zero_samples_is_insufficient() {
        let control = VariantCounts::new("control", 0, 0);
        let variant = VariantCounts::new("treatment", 100, 10);
        assert!(matches!(
            two_proportion_z_test(&control, &variant),
            Err(ExperimentError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_z_test_zero_standard_error_is_insufficient() {
        let control = VariantCounts::new("control", 100, 0);
        let variant = VariantCounts::new("treatment", 100, 0);
        assert!(matches!(
            two_proportion_z_test(&control, &variant),
            Err(ExperimentError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_z_test_rejects_impossible_counts() {
        let control = VariantCounts::new("control", 10, 11);
        let variant = VariantCounts::new("treatment", 10, 1);
        assert!(matches!(
            two_proportion_z_test(&control, &variant),
            Err(ExperimentError::Configuration(_))
        ));
    }

    #[test]
    fn test_p_value_at_zero_and_critical() {
        assert!((calculate_p_value(0.0).unwrap() - 1.0).abs() < 1e-6);
        assert!((calculate_p_value(1.96).unwrap() - 0.05).abs() < 1e-3);
        assert!(calculate_p_value(f64::NAN).is_err());
    }

    #[test]
    fn test_confidence_interval_half_width() {
        let ci = confidence_interval(0.5, 1000, 0.95).unwrap();
        assert!(ci.contains(0.5));
        let half_width = ci.width() / 2.0;
        assert!((half_width - 0.031).abs() < 0.002, "half width {half_width}");
    }

    #[test]
    fn test_confidence_interval_clamped() {
        let ci = confidence_interval(0.01, 20, 0.95).unwrap();
        assert_eq!(ci.lower, 0.0);
        assert!(ci.upper > 0.01);
        assert!(confidence_interval(0.5, 0, 0.95).is_err());
    }

    #[test]
    fn test_effect_size() {
        let h = effect_size(0.5, 0.5).unwrap();
        assert!(h.abs() < 1e-12);
        // Cohen's h for 0.10 → 0.12
        let h = effect_size(0.10, 0.12).unwrap();
        assert!((h - 0.0640).abs() < 1e-3);
        assert_eq!(effect_size(0.12, 0.10).unwrap(), h);
        assert!(effect_size(1.2, 0.1).is_err());
    }

    proptest! {
        #[test]
        fn prop_p_value_symmetric(z in -10.0f64..10.0) {
            let a = calculate_p_value(z).unwrap();
            let b = calculate_p_value(-z).unwrap();
            prop_assert_eq!(a, b);
            prop_assert!((0.0..=1.0).contains(&a));
        }
    }
}
