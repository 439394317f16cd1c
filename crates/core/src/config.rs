use serde::Deserialize;

/// Root engine configuration. Loaded from environment variables with the
/// prefix `EXPERIMENT_ENGINE__` and an optional TOML config file, then passed
/// explicitly to every entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub trend: TrendConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_confidence_level")]
    pub default_confidence_level: f64,
    #[serde(default = "default_bayesian_iterations")]
    pub bayesian_iterations: usize,
    /// Fixed seed for reproducible Monte Carlo runs; entropy-seeded when unset.
    #[serde(default)]
    pub bayesian_seed: Option<u64>,
    #[serde(default = "default_srm_threshold")]
    pub srm_p_value_threshold: f64,
    #[serde(default = "default_min_power")]
    pub min_power: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "default_iqr_multiplier")]
    pub iqr_multiplier: f64,
    #[serde(default = "default_r_squared_significance")]
    pub r_squared_significance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_auto_complete")]
    pub auto_complete: bool,
}

// Default functions
fn default_confidence_level() -> f64 {
    0.95
}
fn default_bayesian_iterations() -> usize {
    10_000
}
fn default_srm_threshold() -> f64 {
    0.001
}
fn default_min_power() -> f64 {
    0.8
}
fn default_iqr_multiplier() -> f64 {
    1.5
}
fn default_r_squared_significance() -> f64 {
    0.5
}
fn default_auto_complete() -> bool {
    true
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_confidence_level: default_confidence_level(),
            bayesian_iterations: default_bayesian_iterations(),
            bayesian_seed: None,
            srm_p_value_threshold: default_srm_threshold(),
            min_power: default_min_power(),
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            iqr_multiplier: default_iqr_multiplier(),
            r_squared_significance: default_r_squared_significance(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_complete: default_auto_complete(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            trend: TrendConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("EXPERIMENT_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
