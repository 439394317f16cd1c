//! Bayesian probability that a variant outperforms control, estimated by
//! Monte Carlo over Beta(conversions + 1, failures + 1) posteriors.

use experiment_core::types::VariantCounts;
use experiment_core::{ExperimentError, ExperimentResult};
use rand::Rng;
use tracing::debug;

use crate::distributions::checked_probability;
use crate::random::VariateGenerator;

pub const DEFAULT_ITERATIONS: usize = 10_000;

fn posterior(counts: &VariantCounts) -> ExperimentResult<(f64, f64)> {
    if counts.conversions > counts.sample_size {
        return Err(ExperimentError::configuration(format!(
            "variant `{}` has {} conversions out of {} samples",
            counts.variant_id, counts.conversions, counts.sample_size
        )));
    }
    let alpha = counts.conversions as f64 + 1.0;
    let beta = (counts.sample_size - counts.conversions) as f64 + 1.0;
    Ok((alpha, beta))
}

/// Fraction of `iterations` posterior draws in which the variant's rate
/// exceeds control's.
pub fn calculate_bayesian_probability<R: Rng>(
    control: &VariantCounts,
    variant: &VariantCounts,
    iterations: usize,
    generator: &mut VariateGenerator<R>,
) -> ExperimentResult<f64> {
    if iterations == 0 {
        return Err(ExperimentError::configuration(
            "Bayesian comparison needs at least one iteration",
        ));
    }

    let (control_alpha, control_beta) = posterior(control)?;
    let (variant_alpha, variant_beta) = posterior(variant)?;

    let mut wins = 0usize;
    for _ in 0..iterations {
        let control_draw = generator.beta(control_alpha, control_beta)?;
        let variant_draw = generator.beta(variant_alpha, variant_beta)?;
        if variant_draw > control_draw {
            wins += 1;
        }
    }

    let probability = wins as f64 / iterations as f64;
    debug!(
        control = %control.variant_id,
        variant = %variant.variant_id,
        iterations,
        probability,
        "Bayesian probability to beat control"
    );
    checked_probability(probability, "Bayesian probability")
}
