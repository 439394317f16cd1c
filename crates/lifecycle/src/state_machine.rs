use chrono::{DateTime, Utc};
use experiment_core::types::{Experiment, ExperimentStatus};
use experiment_core::{ExperimentError, ExperimentResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::validation::validate_for_activation;

/// Describes a single valid state transition for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
    pub trigger: String,
}

/// Guards the experiment lifecycle by enforcing a finite set of valid
/// state transitions. Archived is terminal.
#[derive(Debug, Clone)]
pub struct ExperimentLifecycle {
    pub transitions: Vec<StateTransition>,
}

impl ExperimentLifecycle {
    pub fn new() -> Self {
        use ExperimentStatus::*;

        let table = [
            (Draft, Active, "launch"),
            (Active, Paused, "pause"),
            (Paused, Active, "resume"),
            (Active, Completed, "complete"),
            (Paused, Completed, "complete"),
            (Draft, Archived, "archive"),
            (Active, Archived, "archive"),
            (Paused, Archived, "archive"),
            (Completed, Archived, "archive"),
        ];

        Self {
            transitions: table
                .iter()
                .map(|(from, to, trigger)| StateTransition {
                    from: *from,
                    to: *to,
                    trigger: trigger.to_string(),
                })
                .collect(),
        }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: ExperimentStatus, to: ExperimentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Moves the experiment to `to`. Launching from draft additionally
    /// requires the definition to validate at `now`.
    pub fn transition(
        &self,
        experiment: &mut Experiment,
        to: ExperimentStatus,
        now: DateTime<Utc>,
    ) -> ExperimentResult<()> {
        let from = experiment.status;
        if !self.can_transition(from, to) {
            return Err(ExperimentError::InvalidTransition { from, to });
        }

        if from == ExperimentStatus::Draft && to == ExperimentStatus::Active {
            validate_for_activation(experiment, now).into_result()?;
        }

        experiment.status = to;
        experiment.updated_at = now;
        info!(experiment_id = %experiment.id, %from, %to, "Experiment status changed");
        Ok(())
    }

    pub fn activate(&self, experiment: &mut Experiment, now: DateTime<Utc>) -> ExperimentResult<()> {
        self.transition(experiment, ExperimentStatus::Active, now)
    }

    pub fn pause(&self, experiment: &mut Experiment, now: DateTime<Utc>) -> ExperimentResult<()> {
        if experiment.status != ExperimentStatus::Active {
            return Err(ExperimentError::InvalidTransition {
                from: experiment.status,
                to: ExperimentStatus::Paused,
            });
        }
        self.transition(experiment, ExperimentStatus::Paused, now)
    }

    pub fn resume(&self, experiment: &mut Experiment, now: DateTime<Utc>) -> ExperimentResult<()> {
        if experiment.status != ExperimentStatus::Paused {
            return Err(ExperimentError::InvalidTransition {
                from: experiment.status,
                to: ExperimentStatus::Active,
            });
        }
        self.transition(experiment, ExperimentStatus::Active, now)
    }

    pub fn complete(&self, experiment: &mut Experiment, now: DateTime<Utc>) -> ExperimentResult<()> {
        self.transition(experiment, ExperimentStatus::Completed, now)
    }

    pub fn archive(&self, experiment: &mut Experiment, now: DateTime<Utc>) -> ExperimentResult<()> {
        self.transition(experiment, ExperimentStatus::Archived, now)
    }

    /// Completes a running or paused experiment whose end date has passed.
    /// Returns whether the status changed.
    pub fn complete_if_ended(
        &self,
        experiment: &mut Experiment,
        now: DateTime<Utc>,
    ) -> ExperimentResult<bool> {
        let running = matches!(
            experiment.status,
            ExperimentStatus::Active | ExperimentStatus::Paused
        );
        if running && experiment.has_ended(now) {
            self.complete(experiment, now)?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Default for ExperimentLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
