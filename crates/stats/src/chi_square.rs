//! Chi-square independence test and sample-ratio-mismatch detection.

use experiment_core::{ExperimentError, ExperimentResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::distributions::{checked_probability, chi_square_cdf};

/// Fixed significance level for the independence test.
pub const CHI_SQUARE_ALPHA: f64 = 0.05;

/// Largest gap between observed and expected totals still treated as rounding.
pub const SRM_TOTAL_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChiSquareResult {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
    pub is_significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrmCheck {
    pub observed: Vec<f64>,
    pub expected: Vec<f64>,
    pub p_value: f64,
    pub mismatch: bool,
}

/// Σ (observed − expected)² / expected over paired cells.
pub fn chi_square_statistic(observed: &[f64], expected: &[f64]) -> ExperimentResult<f64> {
    if observed.len() != expected.len() {
        return Err(ExperimentError::configuration(format!(
            "observed has {} cells but expected has {}",
            observed.len(),
            expected.len()
        )));
    }
    if observed.is_empty() {
        return Err(ExperimentError::insufficient("chi-square needs at least one cell"));
    }

    observed
        .iter()
        .zip(expected)
        .try_fold(0.0, |acc, (o, e)| {
            if *e <= 0.0 {
                return Err(ExperimentError::insufficient(
                    "chi-square expected cell is zero",
                ));
            }
            Ok(acc + (o - e).powi(2) / e)
        })
}

/// Expected counts under independence from an observed table's marginals.
pub fn expected_from_marginals(observed: &[Vec<f64>]) -> ExperimentResult<Vec<Vec<f64>>> {
    check_table_shape(observed)?;

    let row_totals: Vec<f64> = observed.iter().map(|row| row.iter().sum()).collect();
    let cols = observed[0].len();
    let col_totals: Vec<f64> = (0..cols)
        .map(|c| observed.iter().map(|row| row[c]).sum())
        .collect();
    let grand_total: f64 = row_totals.iter().sum();

    if grand_total <= 0.0 {
        return Err(ExperimentError::insufficient("contingency table is empty"));
    }

    Ok(row_totals
        .iter()
        .map(|r| col_totals.iter().map(|c| r * c / grand_total).collect())
        .collect())
}

fn check_table_shape(table: &[Vec<f64>]) -> ExperimentResult<()> {
    if table.len() < 2 {
        return Err(ExperimentError::configuration(
            "contingency table needs at least 2 rows",
        ));
    }
    let cols = table[0].len();
    if cols < 2 {
        return Err(ExperimentError::configuration(
            "contingency table needs at least 2 columns",
        ));
    }
    if table.iter().any(|row| row.len() != cols) {
        return Err(ExperimentError::configuration("contingency table is ragged"));
    }
    Ok(())
}

/// Chi-square test of independence over an observed/expected table.
pub fn chi_square_test(
    observed: &[Vec<f64>],
    expected: &[Vec<f64>],
) -> ExperimentResult<ChiSquareResult> {
    check_table_shape(observed)?;
    check_table_shape(expected)?;
    if observed.len() != expected.len() || observed[0].len() != expected[0].len() {
        return Err(ExperimentError::configuration(
            "observed and expected tables differ in shape",
        ));
    }

    let flat_observed: Vec<f64> = observed.iter().flatten().copied().collect();
    let flat_expected: Vec<f64> = expected.iter().flatten().copied().collect();
    let statistic = chi_square_statistic(&flat_observed, &flat_expected)?;

    let degrees_of_freedom = (observed.len() - 1) * (observed[0].len() - 1);
    let p_value = checked_probability(
        1.0 - chi_square_cdf(statistic, degrees_of_freedom as f64)?,
        "chi-square p-value",
    )?;

    Ok(ChiSquareResult {
        statistic,
        degrees_of_freedom,
        p_value,
        is_significant: p_value < CHI_SQUARE_ALPHA,
    })
}

/// Goodness-of-fit p-value of an observed traffic split against the expected
/// one. Totals that disagree by more than [`SRM_TOTAL_TOLERANCE`] indicate a
/// broken traffic accounting and return 0 without running the test.
pub fn calculate_srm_p_value(observed: &[f64], expected: &[f64]) -> ExperimentResult<f64> {
    if observed.len() != expected.len() {
        return Err(ExperimentError::configuration(format!(
            "observed has {} groups but expected has {}",
            observed.len(),
            expected.len()
        )));
    }
    if observed.len() < 2 {
        return Err(ExperimentError::configuration(
            "sample ratio check needs at least 2 groups",
        ));
    }

    let observed_total: f64 = observed.iter().sum();
    let expected_total: f64 = expected.iter().sum();
    if (observed_total - expected_total).abs() > SRM_TOTAL_TOLERANCE {
        warn!(observed_total, expected_total, "Traffic totals disagree, reporting SRM");
        return Ok(0.0);
    }

    let statistic = chi_square_statistic(observed, expected)?;
    let degrees_of_freedom = (observed.len() - 1) as f64;
    checked_probability(
        1.0 - chi_square_cdf(statistic, degrees_of_freedom)?,
        "SRM p-value",
    )
}

/// Splits `total` across groups in proportion to their weights.
pub fn expected_counts(total: f64, weights: &[u32]) -> ExperimentResult<Vec<f64>> {
    let weight_sum: u64 = weights.iter().map(|w| u64::from(*w)).sum();
    if weight_sum == 0 {
        return Err(ExperimentError::configuration("weights sum to zero"));
    }
    Ok(weights
        .iter()
        .map(|w| total * *w as f64 / weight_sum as f64)
        .collect())
}

/// Runs the SRM test of observed sample sizes against configured weights.
///
/// Zero-weight groups take no part in the test, unless traffic reached them,
/// which is reported as a mismatch outright.
pub fn check_sample_ratio(
    observed: &[u64],
    weights: &[u32],
    threshold: f64,
) -> ExperimentResult<SrmCheck> {
    if observed.len() != weights.len() {
        return Err(ExperimentError::configuration(format!(
            "{} observed groups but {} weights",
            observed.len(),
            weights.len()
        )));
    }
    let all_observed: Vec<f64> = observed.iter().map(|o| *o as f64).collect();
    let total: f64 = all_observed.iter().sum();
    if total <= 0.0 {
        return Err(ExperimentError::insufficient("no traffic to check sample ratio"));
    }
    let all_expected = expected_counts(total, weights)?;

    let leaked = observed.iter().zip(weights).any(|(o, w)| *w == 0 && *o > 0);
    let (tested_observed, tested_expected): (Vec<f64>, Vec<f64>) = all_observed
        .iter()
        .zip(&all_expected)
        .zip(weights)
        .filter(|(_, w)| **w > 0)
        .map(|((o, e), _)| (*o, *e))
        .unzip();

    let p_value = if leaked {
        warn!("Traffic reached a zero-weight variant, reporting SRM");
        0.0
    } else if tested_observed.len() < 2 {
        1.0
    } else {
        calculate_srm_p_value(&tested_observed, &tested_expected)?
    };

    Ok(SrmCheck {
        mismatch: p_value < threshold,
        observed: all_observed,
        expected: all_expected,
        p_value,
    })
}
