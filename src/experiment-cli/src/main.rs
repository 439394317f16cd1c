//! Experiment CLI: validation, assignment and statistical analysis of
//! experiment definitions and counts stored as JSON files.
//!
//! Reports are written to stdout as JSON; logs go to stderr.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use experiment_core::config::EngineConfig;
use experiment_core::types::{
    Experiment, ExperimentOverride, PropertyValue, UserContext, VariantCounts,
};
use experiment_core::{ExperimentStore, InMemoryStore};
use experiment_engine::ExperimentService;
use experiment_lifecycle::validate_experiment;
use experiment_stats::chi_square::expected_from_marginals;
use experiment_stats::{calculate_power, calculate_srm_p_value, chi_square_test};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "experiment-cli")]
#[command(about = "Deterministic experiment assignment and statistical analysis")]
#[command(version)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, env = "EXPERIMENT_ENGINE_CONFIG")]
    config: Option<String>,

    /// Default confidence level (overrides config)
    #[arg(long, env = "EXPERIMENT_ENGINE__ANALYSIS__DEFAULT_CONFIDENCE_LEVEL")]
    confidence_level: Option<f64>,

    /// Monte Carlo iterations for the Bayesian comparison (overrides config)
    #[arg(long, env = "EXPERIMENT_ENGINE__ANALYSIS__BAYESIAN_ITERATIONS")]
    bayesian_iterations: Option<usize>,

    /// Seed for reproducible Bayesian estimates (overrides config)
    #[arg(long, env = "EXPERIMENT_ENGINE__ANALYSIS__BAYESIAN_SEED")]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check an experiment definition and list every violated rule
    Validate {
        #[arg(long)]
        experiment: PathBuf,
    },
    /// Assign a user to a variant of an active experiment
    Assign {
        #[arg(long)]
        experiment: PathBuf,
        #[arg(long)]
        user: String,
        /// JSON object of user properties used by audience rules
        #[arg(long)]
        properties: Option<String>,
        /// JSON array of overrides
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Analyze per-variant counts against the experiment's control
    Analyze {
        #[arg(long)]
        experiment: PathBuf,
        /// JSON array of {variant_id, sample_size, conversions}
        #[arg(long)]
        counts: PathBuf,
    },
    /// Required sample size per variant for a relative lift
    SampleSize {
        #[arg(long)]
        baseline: f64,
        /// Relative minimum detectable effect, e.g. 0.1 for +10%
        #[arg(long)]
        mde: f64,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        power: Option<f64>,
        #[arg(long, default_value_t = 2)]
        variants: usize,
    },
    /// Power to detect a relative lift at a given per-variant sample size
    Power {
        #[arg(long)]
        baseline: f64,
        #[arg(long)]
        mde: f64,
        #[arg(long)]
        sample_size: u64,
        #[arg(long)]
        alpha: Option<f64>,
    },
    /// Chi-square independence test of a JSON contingency table
    ChiSquare {
        /// JSON array of rows, e.g. [[10, 20], [30, 40]]
        #[arg(long)]
        observed: PathBuf,
    },
    /// Sample ratio mismatch p-value of observed against expected counts
    Srm {
        #[arg(long, value_delimiter = ',', required = true)]
        observed: Vec<f64>,
        #[arg(long, value_delimiter = ',', required = true)]
        expected: Vec<f64>,
    },
    /// IQR outliers of a metric series
    Outliers {
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
        #[arg(long)]
        iqr_multiplier: Option<f64>,
    },
    /// Least-squares trend of a metric series
    Trend {
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        times: Vec<f64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "experiment_cli=info,experiment_engine=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Some(level) = cli.confidence_level {
        config.analysis.default_confidence_level = level;
    }
    if let Some(iterations) = cli.bayesian_iterations {
        config.analysis.bayesian_iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.analysis.bayesian_seed = Some(seed);
    }

    info!(
        confidence_level = config.analysis.default_confidence_level,
        bayesian_iterations = config.analysis.bayesian_iterations,
        seeded = config.analysis.bayesian_seed.is_some(),
        "Configuration loaded"
    );

    run(cli.command, config)
}

fn run(command: Command, config: EngineConfig) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let service = ExperimentService::new(config, Arc::clone(&store));

    match command {
        Command::Validate { experiment } => {
            let experiment: Experiment = read_json(&experiment)?;
            let report = validate_experiment(&experiment);
            if !report.is_valid {
                warn!(experiment_id = %experiment.id, issues = report.issues.len(), "Experiment is invalid");
            }
            print_json(&report)
        }
        Command::Assign {
            experiment,
            user,
            properties,
            overrides,
        } => {
            let experiment: Experiment = read_json(&experiment)?;
            let experiment_id = experiment.id;
            store.save_experiment(experiment)?;

            if let Some(path) = overrides {
                let overrides: Vec<ExperimentOverride> = read_json(&path)?;
                for override_ in overrides {
                    service.add_override(override_)?;
                }
            }

            let mut context = UserContext::new(&user);
            if let Some(raw) = properties {
                context.properties = serde_json::from_str::<HashMap<String, PropertyValue>>(&raw)
                    .context("--properties must be a JSON object")?;
            }

            let outcome = service.assign_variant(&context, &experiment_id)?;
            print_json(&outcome)
        }
        Command::Analyze { experiment, counts } => {
            let experiment: Experiment = read_json(&experiment)?;
            let counts: Vec<VariantCounts> = read_json(&counts)?;
            let experiment_id = experiment.id;
            store.save_experiment(experiment)?;

            let results = service.analyze_results(&experiment_id, &counts, None)?;
            print_json(&results)
        }
        Command::SampleSize {
            baseline,
            mde,
            alpha,
            power,
            variants,
        } => {
            let estimate = service.calculate_sample_size(baseline, mde, alpha, power, variants)?;
            print_json(&estimate)
        }
        Command::Power {
            baseline,
            mde,
            sample_size,
            alpha,
        } => {
            let alpha =
                alpha.unwrap_or(1.0 - service.config().analysis.default_confidence_level);
            let power = calculate_power(baseline, mde, sample_size, alpha)?;
            print_json(&serde_json::json!({
                "power": power,
                "alpha": alpha,
                "sample_size_per_variant": sample_size,
            }))
        }
        Command::ChiSquare { observed } => {
            let observed: Vec<Vec<f64>> = read_json(&observed)?;
            let expected = expected_from_marginals(&observed)?;
            print_json(&chi_square_test(&observed, &expected)?)
        }
        Command::Srm { observed, expected } => {
            let p_value = calculate_srm_p_value(&observed, &expected)?;
            let threshold = service.config().analysis.srm_p_value_threshold;
            print_json(&serde_json::json!({
                "p_value": p_value,
                "threshold": threshold,
                "mismatch": p_value < threshold,
            }))
        }
        Command::Outliers {
            values,
            iqr_multiplier,
        } => {
            let report = match iqr_multiplier {
                Some(k) => experiment_stats::detect_outliers(&values, k)?,
                None => service.detect_outliers(&values)?,
            };
            print_json(&report)
        }
        Command::Trend { values, times } => {
            let report = service.detect_trend(&values, &times)?;
            print_json(&report)
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
