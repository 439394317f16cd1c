//! Statistical inference for experiments: proportion tests, power and
//! sample-size analysis, chi-square and sample-ratio-mismatch checks,
//! Bayesian comparison, and trend/anomaly detection.

pub mod analysis;
pub mod bayesian;
pub mod chi_square;
pub mod distributions;
pub mod hypothesis;
pub mod power;
pub mod random;
pub mod trend;

pub use analysis::{analyze_results, ExperimentResults, Recommendation};
pub use bayesian::{calculate_bayesian_probability, DEFAULT_ITERATIONS};
pub use chi_square::{calculate_srm_p_value, chi_square_test, ChiSquareResult};
pub use hypothesis::{calculate_p_value, confidence_interval, effect_size, two_proportion_z_test};
pub use power::{
    calculate_multi_variant_sample_size, calculate_power, calculate_required_sample_size,
    calculate_sample_size, SampleSizeEstimate,
};
pub use random::VariateGenerator;
pub use trend::{detect_outliers, detect_trend, OutlierReport, TrendDirection, TrendReport};
