use chrono::{DateTime, Utc};
use experiment_core::types::{
    AssignmentSource, Experiment, ExperimentOverride, ExperimentStatus, UserAssignment,
    UserContext,
};
use experiment_core::{ExperimentError, ExperimentResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audience::{check_audience, Ineligibility};
use crate::hashing::traffic_bucket;

/// Result of an assignment request. Ineligibility is an ordinary outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AssignmentOutcome {
    Assigned(UserAssignment),
    Ineligible(Ineligibility),
}

impl AssignmentOutcome {
    pub fn assignment(&self) -> Option<&UserAssignment> {
        match self {
            AssignmentOutcome::Assigned(a) => Some(a),
            AssignmentOutcome::Ineligible(_) => None,
        }
    }

    pub fn variant_id(&self) -> Option<&str> {
        self.assignment().map(|a| a.variant_id.as_str())
    }
}

/// Assigns a user to a variant of an active experiment.
///
/// A matching override wins over audience filtering and hashing. Otherwise
/// the user must pass the audience checks and is placed by walking the
/// variants' cumulative weight ranges with their traffic bucket. The
/// returned record is not persisted.
pub fn assign(
    user: &UserContext,
    experiment: &Experiment,
    overrides: &[ExperimentOverride],
    now: DateTime<Utc>,
) -> ExperimentResult<AssignmentOutcome> {
    if experiment.status != ExperimentStatus::Active {
        return Err(ExperimentError::NotActive {
            experiment_id: experiment.id,
            status: experiment.status,
        });
    }
    if user.user_id.trim().is_empty() {
        return Err(ExperimentError::configuration("user id must not be empty"));
    }
    if let Some(variant) = experiment.variants.iter().find(|v| v.weight > 100) {
        return Err(ExperimentError::configuration(format!(
            "variant '{}' of experiment {} has weight {}, expected 0..=100",
            variant.id, experiment.id, variant.weight
        )));
    }
    let total = experiment.total_weight();
    if total != 100 {
        return Err(ExperimentError::configuration(format!(
            "variant weights of experiment {} sum to {total}, expected 100",
            experiment.id
        )));
    }

    let bucket = traffic_bucket(&experiment.id, &user.user_id);

    if let Some(forced) = select_override(overrides, &user.user_id, experiment, now) {
        if experiment.variant(&forced.variant_id).is_none() {
            return Err(ExperimentError::configuration(format!(
                "override targets unknown variant '{}' of experiment {}",
                forced.variant_id, experiment.id
            )));
        }
        debug!(
            experiment_id = %experiment.id,
            user_id = %user.user_id,
            variant_id = %forced.variant_id,
            "Assignment forced by override"
        );
        return Ok(AssignmentOutcome::Assigned(UserAssignment {
            user_id: user.user_id.clone(),
            experiment_id: experiment.id,
            variant_id: forced.variant_id.clone(),
            assigned_at: now,
            traffic_bucket: bucket,
            should_reassign: false,
            source: AssignmentSource::Override,
        }));
    }

    if let Some(audience) = &experiment.target_audience {
        if let Err(reason) = check_audience(&experiment.id, audience, user) {
            debug!(
                experiment_id = %experiment.id,
                user_id = %user.user_id,
                %reason,
                "User not eligible"
            );
            return Ok(AssignmentOutcome::Ineligible(reason));
        }
    }

    let variant_id = pick_variant(experiment, bucket)?;
    debug!(
        experiment_id = %experiment.id,
        user_id = %user.user_id,
        bucket,
        variant_id = %variant_id,
        "User bucketed"
    );

    Ok(AssignmentOutcome::Assigned(UserAssignment {
        user_id: user.user_id.clone(),
        experiment_id: experiment.id,
        variant_id,
        assigned_at: now,
        traffic_bucket: bucket,
        should_reassign: false,
        source: AssignmentSource::Hashed,
    }))
}

/// Like [`assign`], but returns `existing` when it is still usable: present,
/// not flagged for reassignment and pointing at a variant the experiment
/// still has. A live override still takes precedence over `existing`.
pub fn assign_sticky(
    user: &UserContext,
    experiment: &Experiment,
    overrides: &[ExperimentOverride],
    existing: Option<&UserAssignment>,
    now: DateTime<Utc>,
) -> ExperimentResult<AssignmentOutcome> {
    if experiment.status != ExperimentStatus::Active {
        return Err(ExperimentError::NotActive {
            experiment_id: experiment.id,
            status: experiment.status,
        });
    }

    let overridden = select_override(overrides, &user.user_id, experiment, now).is_some();
    if let Some(previous) = existing.filter(|_| !overridden) {
        let reusable = previous.experiment_id == experiment.id
            && previous.user_id == user.user_id
            && !previous.should_reassign
            && experiment.variant(&previous.variant_id).is_some();
        if reusable {
            return Ok(AssignmentOutcome::Assigned(previous.clone()));
        }
    }

    assign(user, experiment, overrides, now)
}

/// Most specific unexpired override for this user and experiment.
fn select_override<'a>(
    overrides: &'a [ExperimentOverride],
    user_id: &str,
    experiment: &Experiment,
    now: DateTime<Utc>,
) -> Option<&'a ExperimentOverride> {
    overrides
        .iter()
        .filter(|o| !o.is_expired(now) && o.applies_to(user_id, &experiment.id))
        .max_by_key(|o| o.specificity())
}

/// Walks variants in order over [low, high) ranges of their weights.
fn pick_variant(experiment: &Experiment, bucket: u8) -> ExperimentResult<String> {
    let bucket = u64::from(bucket);
    let mut low = 0u64;
    for variant in &experiment.variants {
        let high = low + u64::from(variant.weight);
        if bucket >= low && bucket < high {
            return Ok(variant.id.clone());
        }
        low = high;
    }
    Err(ExperimentError::configuration(format!(
        "bucket {bucket} not covered by the variants of experiment {}",
        experiment.id
    )))
}
