use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ExperimentStatus;

pub type ExperimentResult<T> = Result<T, ExperimentError>;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Experiment validation failed: {0}")]
    Validation(ValidationError),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Experiment {experiment_id} is {status}; assignment requires an active experiment")]
    NotActive {
        experiment_id: Uuid,
        status: ExperimentStatus,
    },

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("Experiment not found: {0}")]
    NotFound(Uuid),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExperimentError {
    pub fn insufficient(msg: impl Into<String>) -> Self {
        ExperimentError::InsufficientData(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ExperimentError::Configuration(msg.into())
    }
}

impl From<ValidationError> for ExperimentError {
    fn from(err: ValidationError) -> Self {
        ExperimentError::Validation(err)
    }
}

/// Every invariant an experiment violates, not just the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.issues.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum ValidationIssue {
    EmptyName,
    TooFewVariants { count: usize },
    WeightOutOfRange { variant_id: String, weight: u32 },
    WeightSum { total: u64 },
    EmptyVariantId,
    DuplicateVariantId { variant_id: String },
    MultipleControls { count: usize },
    NoPrimaryMetric,
    EndBeforeStart,
    StartInFuture,
    AudiencePercentageOutOfRange { percentage: u32 },
    EmptyRuleProperty,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::EmptyName => write!(f, "experiment name is empty"),
            ValidationIssue::TooFewVariants { count } => {
                write!(f, "experiment needs at least 2 variants, has {count}")
            }
            ValidationIssue::WeightOutOfRange { variant_id, weight } => {
                write!(f, "variant `{variant_id}` weight {weight} is outside 0..=100")
            }
            ValidationIssue::WeightSum { total } => {
                write!(f, "variant weights sum to {total}, expected 100")
            }
            ValidationIssue::EmptyVariantId => write!(f, "variant id is empty"),
            ValidationIssue::DuplicateVariantId { variant_id } => {
                write!(f, "variant id `{variant_id}` is used more than once")
            }
            ValidationIssue::MultipleControls { count } => {
                write!(f, "{count} variants are marked as control, at most 1 allowed")
            }
            ValidationIssue::NoPrimaryMetric => write!(f, "no metric is marked primary"),
            ValidationIssue::EndBeforeStart => write!(f, "end date is not after start date"),
            ValidationIssue::StartInFuture => write!(f, "start date is in the future"),
            ValidationIssue::AudiencePercentageOutOfRange { percentage } => {
                write!(f, "audience percentage {percentage} is outside 0..=100")
            }
            ValidationIssue::EmptyRuleProperty => {
                write!(f, "audience rule has an empty property name")
            }
        }
    }
}
