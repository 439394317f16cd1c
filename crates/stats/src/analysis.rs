//! Experiment results report: every variant compared against control, a
//! sample-ratio check over the configured weights, and a recommendation.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use experiment_core::config::AnalysisConfig;
use experiment_core::types::{Experiment, VariantCounts};
use experiment_core::{ExperimentError, ExperimentResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bayesian::calculate_bayesian_probability;
use crate::chi_square::{check_sample_ratio, SrmCheck};
use crate::hypothesis::{
    calculate_p_value, confidence_interval, effect_size, is_significant, observed_rate,
    two_proportion_z_test, ConfidenceInterval,
};
use crate::power::power_for_rates;
use crate::random::VariateGenerator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: Uuid,
    pub experiment_name: String,
    pub confidence_level: f64,
    pub control_variant_id: String,
    pub variants: Vec<VariantResult>,
    pub srm: SrmCheck,
    pub winner: Option<String>,
    pub recommendation: Recommendation,
    pub analyzed_at: DateTime<Utc>,
}

impl ExperimentResults {
    pub fn variant(&self, variant_id: &str) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }
}

/// Per-variant statistics. `comparison` is absent for the control, and
/// for arms the data cannot yet be compared on. An arm without samples has
/// no rate and no interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub is_control: bool,
    pub sample_size: u64,
    pub conversions: u64,
    pub conversion_rate: Option<f64>,
    pub confidence_interval: Option<ConfidenceInterval>,
    pub comparison: Option<ComparisonResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub z_score: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub effect_size: f64,
    pub absolute_lift: f64,
    /// `None` when the control rate is zero.
    pub relative_lift: Option<f64>,
    pub power: f64,
    pub probability_to_beat_control: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Recommendation {
    /// Traffic split does not match the weights; results are not trustworthy.
    InvestigateTrafficSplit,
    ShipVariant { variant_id: String },
    KeepControl,
    KeepCollecting,
    NoSignificantDifference,
}

/// Analyzes per-variant counts for an experiment.
pub fn analyze_results<R: Rng>(
    experiment: &Experiment,
    counts: &[VariantCounts],
    confidence_level: f64,
    config: &AnalysisConfig,
    generator: &mut VariateGenerator<R>,
) -> ExperimentResult<ExperimentResults> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(ExperimentError::configuration(format!(
            "confidence level must be strictly between 0 and 1, got {confidence_level}"
        )));
    }
    if experiment.variants.len() < 2 {
        return Err(ExperimentError::configuration(
            "analysis needs an experiment with at least 2 variants",
        ));
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = counts.iter().find(|c| !seen.insert(c.variant_id.as_str())) {
        return Err(ExperimentError::configuration(format!(
            "counts list variant `{}` more than once",
            duplicate.variant_id
        )));
    }
    let by_variant: HashMap<&str, &VariantCounts> =
        counts.iter().map(|c| (c.variant_id.as_str(), c)).collect();
    if let Some(unknown) = counts.iter().find(|c| experiment.variant(&c.variant_id).is_none()) {
        return Err(ExperimentError::configuration(format!(
            "counts reference unknown variant `{}`",
            unknown.variant_id
        )));
    }

    let ordered: Vec<&VariantCounts> = experiment
        .variants
        .iter()
        .map(|v| {
            by_variant.get(v.id.as_str()).copied().ok_or_else(|| {
                ExperimentError::insufficient(format!("no counts for variant `{}`", v.id))
            })
        })
        .collect::<ExperimentResult<_>>()?;

    let control_variant = experiment
        .control()
        .ok_or_else(|| ExperimentError::configuration("experiment has no variants"))?;
    let control_counts = by_variant[control_variant.id.as_str()];
    let control_rate = sparse(observed_rate(control_counts))?;

    let mut variants = Vec::with_capacity(ordered.len());
    let mut pending = false;
    for (variant, variant_counts) in experiment.variants.iter().zip(&ordered) {
        let rate = sparse(observed_rate(variant_counts))?;
        let interval = rate
            .map(|rate| confidence_interval(rate, variant_counts.sample_size, confidence_level))
            .transpose()?;
        let is_control = variant.id == control_variant.id;

        let comparison = match (is_control, control_rate, rate) {
            (false, Some(control_rate), Some(rate)) => sparse(compare(
                control_counts,
                variant_counts,
                control_rate,
                rate,
                confidence_level,
                config,
                generator,
            ))?,
            _ => None,
        };
        if !is_control && variant.weight > 0 && comparison.is_none() {
            debug!(experiment_id = %experiment.id, variant_id = %variant.id, "Variant not comparable yet");
            pending = true;
        }

        variants.push(VariantResult {
            variant_id: variant_counts.variant_id.clone(),
            is_control,
            sample_size: variant_counts.sample_size,
            conversions: variant_counts.conversions,
            conversion_rate: rate,
            confidence_interval: interval,
            comparison,
        });
    }

    let sample_sizes: Vec<u64> = ordered.iter().map(|c| c.sample_size).collect();
    let weights: Vec<u32> = experiment.variants.iter().map(|v| v.weight).collect();
    let srm = check_sample_ratio(&sample_sizes, &weights, config.srm_p_value_threshold)?;
    if srm.mismatch {
        warn!(experiment_id = %experiment.id, p_value = srm.p_value, "Sample ratio mismatch detected");
    }

    let winner = variants
        .iter()
        .filter(|v| {
            v.comparison
                .as_ref()
                .is_some_and(|c| c.is_significant && c.absolute_lift > 0.0)
        })
        .max_by(|a, b| {
            let rate = |v: &VariantResult| v.conversion_rate.unwrap_or(0.0);
            rate(a).total_cmp(&rate(b))
        })
        .map(|v| v.variant_id.clone());

    let recommendation = recommend(&variants, &srm, winner.as_deref(), pending, config.min_power);

    info!(
        experiment_id = %experiment.id,
        ?recommendation,
        winner = ?winner,
        "Experiment analyzed"
    );

    Ok(ExperimentResults {
        experiment_id: experiment.id,
        experiment_name: experiment.name.clone(),
        confidence_level,
        control_variant_id: control_variant.id.clone(),
        variants,
        srm,
        winner,
        recommendation,
        analyzed_at: Utc::now(),
    })
}

/// Compares one arm with control. Only called when both arms have samples.
fn compare<R: Rng>(
    control_counts: &VariantCounts,
    variant_counts: &VariantCounts,
    control_rate: f64,
    rate: f64,
    confidence_level: f64,
    config: &AnalysisConfig,
    generator: &mut VariateGenerator<R>,
) -> ExperimentResult<ComparisonResult> {
    let test = two_proportion_z_test(control_counts, variant_counts)?;
    let p_value = calculate_p_value(test.z_score)?;
    let n_per_arm = control_counts.sample_size.min(variant_counts.sample_size);
    Ok(ComparisonResult {
        z_score: test.z_score,
        p_value,
        is_significant: is_significant(p_value, confidence_level),
        effect_size: effect_size(control_rate, rate)?,
        absolute_lift: rate - control_rate,
        relative_lift: (control_rate > 0.0).then(|| (rate - control_rate) / control_rate),
        power: power_for_rates(control_rate, rate, n_per_arm, 1.0 - confidence_level)?,
        probability_to_beat_control: calculate_bayesian_probability(
            control_counts,
            variant_counts,
            config.bayesian_iterations,
            generator,
        )?,
    })
}

/// Turns `InsufficientData` into `None` so one thin arm does not sink the
/// report. Every other error still propagates.
fn sparse<T>(result: ExperimentResult<T>) -> ExperimentResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ExperimentError::InsufficientData(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn recommend(
    variants: &[VariantResult],
    srm: &SrmCheck,
    winner: Option<&str>,
    pending: bool,
    min_power: f64,
) -> Recommendation {
    if srm.mismatch {
        return Recommendation::InvestigateTrafficSplit;
    }
    if let Some(variant_id) = winner {
        return Recommendation::ShipVariant {
            variant_id: variant_id.to_string(),
        };
    }

    let comparisons: Vec<&ComparisonResult> =
        variants.iter().filter_map(|v| v.comparison.as_ref()).collect();
    if pending || comparisons.is_empty() {
        return Recommendation::KeepCollecting;
    }
    if comparisons
        .iter()
        .all(|c| c.is_significant && c.absolute_lift < 0.0)
    {
        return Recommendation::KeepControl;
    }
    if comparisons.iter().any(|c| c.power < min_power) {
        return Recommendation::KeepCollecting;
    }
    Recommendation::NoSignificantDifference
}
