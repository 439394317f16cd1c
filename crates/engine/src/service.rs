//! Experiment service: persists definitions and assignments through an
//! [`ExperimentStore`] and runs lifecycle, assignment and analysis on top.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use experiment_assignment::{assign_sticky, AssignmentOutcome};
use experiment_core::types::{
    Experiment, ExperimentEvent, ExperimentOverride, ExperimentStatus, TimeWindow,
    UserAssignment, UserContext, VariantCounts,
};
use experiment_core::{EngineConfig, ExperimentError, ExperimentResult, ExperimentStore};
use experiment_lifecycle::{validate_experiment, ExperimentLifecycle, ValidationReport};
use experiment_stats::chi_square::{check_sample_ratio, SrmCheck};
use experiment_stats::{
    analyze_results, calculate_multi_variant_sample_size, detect_outliers, detect_trend,
    ExperimentResults, OutlierReport, SampleSizeEstimate, TrendReport, VariateGenerator,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};
use uuid::Uuid;

/// Entry point for experiment operations against a shared store.
pub struct ExperimentService<S: ExperimentStore> {
    config: EngineConfig,
    store: Arc<S>,
    lifecycle: ExperimentLifecycle,
}

impl<S: ExperimentStore> ExperimentService<S> {
    pub fn new(config: EngineConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            lifecycle: ExperimentLifecycle::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ─── Definitions ───────────────────────────────────────────────────────

    /// Stores a new draft experiment and returns its id.
    pub fn create_experiment(&self, experiment: Experiment) -> ExperimentResult<Uuid> {
        if experiment.status != ExperimentStatus::Draft {
            return Err(ExperimentError::configuration(format!(
                "new experiments must start as draft, got {}",
                experiment.status
            )));
        }
        if self.store.get_experiment(&experiment.id)?.is_some() {
            return Err(ExperimentError::configuration(format!(
                "experiment {} already exists",
                experiment.id
            )));
        }

        let id = experiment.id;
        info!(experiment_id = %id, name = %experiment.name, "Experiment created");
        self.store.save_experiment(experiment)?;
        Ok(id)
    }

    pub fn get_experiment(&self, experiment_id: &Uuid) -> ExperimentResult<Experiment> {
        self.store
            .get_experiment(experiment_id)?
            .ok_or(ExperimentError::NotFound(*experiment_id))
    }

    pub fn validate_experiment(&self, experiment_id: &Uuid) -> ExperimentResult<ValidationReport> {
        Ok(validate_experiment(&self.get_experiment(experiment_id)?))
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    pub fn activate(&self, experiment_id: &Uuid) -> ExperimentResult<Experiment> {
        self.apply(experiment_id, |lifecycle, experiment, now| {
            lifecycle.activate(experiment, now)
        })
    }

    pub fn pause(&self, experiment_id: &Uuid) -> ExperimentResult<Experiment> {
        self.apply(experiment_id, |lifecycle, experiment, now| {
            lifecycle.pause(experiment, now)
        })
    }

    pub fn resume(&self, experiment_id: &Uuid) -> ExperimentResult<Experiment> {
        self.apply(experiment_id, |lifecycle, experiment, now| {
            lifecycle.resume(experiment, now)
        })
    }

    pub fn complete(&self, experiment_id: &Uuid) -> ExperimentResult<Experiment> {
        self.apply(experiment_id, |lifecycle, experiment, now| {
            lifecycle.complete(experiment, now)
        })
    }

    pub fn archive(&self, experiment_id: &Uuid) -> ExperimentResult<Experiment> {
        self.apply(experiment_id, |lifecycle, experiment, now| {
            lifecycle.archive(experiment, now)
        })
    }

    fn apply<F>(&self, experiment_id: &Uuid, transition: F) -> ExperimentResult<Experiment>
    where
        F: FnOnce(&ExperimentLifecycle, &mut Experiment, DateTime<Utc>) -> ExperimentResult<()>,
    {
        let mut experiment = self.get_experiment(experiment_id)?;
        transition(&self.lifecycle, &mut experiment, Utc::now())?;
        self.store.save_experiment(experiment.clone())?;
        Ok(experiment)
    }

    // ─── Assignment ────────────────────────────────────────────────────────

    pub fn add_override(&self, override_: ExperimentOverride) -> ExperimentResult<Uuid> {
        if let Some(experiment_id) = override_.experiment_id {
            let experiment = self.get_experiment(&experiment_id)?;
            if experiment.variant(&override_.variant_id).is_none() {
                return Err(ExperimentError::configuration(format!(
                    "override targets unknown variant '{}' of experiment {experiment_id}",
                    override_.variant_id
                )));
            }
        }
        let id = self.store.add_override(override_)?;
        info!(override_id = %id, "Override registered");
        Ok(id)
    }

    /// Assigns a user, reusing a stored assignment when it is still valid.
    /// Hashed assignments are persisted at most once per (user, experiment);
    /// override assignments are never persisted.
    pub fn assign_variant(
        &self,
        user: &UserContext,
        experiment_id: &Uuid,
    ) -> ExperimentResult<AssignmentOutcome> {
        self.assign_variant_at(user, experiment_id, Utc::now())
    }

    pub fn assign_variant_at(
        &self,
        user: &UserContext,
        experiment_id: &Uuid,
        now: DateTime<Utc>,
    ) -> ExperimentResult<AssignmentOutcome> {
        let mut experiment = self.get_experiment(experiment_id)?;

        if self.config.lifecycle.auto_complete
            && self.lifecycle.complete_if_ended(&mut experiment, now)?
        {
            info!(experiment_id = %experiment.id, "Experiment reached its end date");
            self.store.save_experiment(experiment.clone())?;
        }

        let overrides = self
            .store
            .active_overrides(experiment_id, &user.user_id, now)?;
        let existing = self.store.get_assignment(&user.user_id, experiment_id)?;

        let outcome = assign_sticky(user, &experiment, &overrides, existing.as_ref(), now)?;
        let assignment = match outcome {
            AssignmentOutcome::Assigned(assignment) => assignment,
            AssignmentOutcome::Ineligible(reason) => {
                metrics::counter!("experiment.ineligible").increment(1);
                return Ok(AssignmentOutcome::Ineligible(reason));
            }
        };

        let stored = self.persist_assignment(assignment, existing.as_ref())?;
        metrics::counter!("experiment.assignments").increment(1);
        Ok(AssignmentOutcome::Assigned(stored))
    }

    fn persist_assignment(
        &self,
        assignment: UserAssignment,
        existing: Option<&UserAssignment>,
    ) -> ExperimentResult<UserAssignment> {
        use experiment_core::types::AssignmentSource;

        if assignment.source == AssignmentSource::Override {
            return Ok(assignment);
        }
        match existing {
            Some(previous) if *previous == assignment => Ok(assignment),
            Some(_) => {
                debug!(
                    experiment_id = %assignment.experiment_id,
                    user_id = %assignment.user_id,
                    variant_id = %assignment.variant_id,
                    "Replacing stale assignment"
                );
                self.store.replace_assignment(assignment)
            }
            None => self.store.insert_assignment_if_absent(assignment),
        }
    }

    /// Flags the stored assignment so the next request re-buckets the user.
    /// Returns `false` when the user has no stored assignment.
    pub fn force_reassign(&self, user_id: &str, experiment_id: &Uuid) -> ExperimentResult<bool> {
        let Some(mut assignment) = self.store.get_assignment(user_id, experiment_id)? else {
            return Ok(false);
        };
        assignment.should_reassign = true;
        self.store.replace_assignment(assignment)?;
        info!(experiment_id = %experiment_id, user_id, "Assignment flagged for reassignment");
        Ok(true)
    }

    // ─── Events ────────────────────────────────────────────────────────────

    /// Records a metric event. Events from users without a stored
    /// assignment (override traffic) are kept but never counted in analysis.
    pub fn record_event(&self, event: ExperimentEvent) -> ExperimentResult<()> {
        let experiment = self.get_experiment(&event.experiment_id)?;
        if experiment.status != ExperimentStatus::Active {
            return Err(ExperimentError::NotActive {
                experiment_id: experiment.id,
                status: experiment.status,
            });
        }
        if experiment.variant(&event.variant_id).is_none() {
            return Err(ExperimentError::configuration(format!(
                "event references unknown variant '{}'",
                event.variant_id
            )));
        }
        if let Some(assignment) = self
            .store
            .get_assignment(&event.user_id, &event.experiment_id)?
            .filter(|a| a.variant_id != event.variant_id)
        {
            return Err(ExperimentError::configuration(format!(
                "event for user '{}' names variant '{}' but the user is assigned to '{}'",
                event.user_id, event.variant_id, assignment.variant_id
            )));
        }

        self.store.append_event(event)?;
        metrics::counter!("experiment.events").increment(1);
        Ok(())
    }

    // ─── Analysis ──────────────────────────────────────────────────────────

    /// Analyzes caller-supplied counts. `confidence_level` defaults to the
    /// configured level.
    pub fn analyze_results(
        &self,
        experiment_id: &Uuid,
        counts: &[VariantCounts],
        confidence_level: Option<f64>,
    ) -> ExperimentResult<ExperimentResults> {
        let experiment = self.get_experiment(experiment_id)?;
        self.analyze(&experiment, counts, confidence_level)
    }

    /// Aggregates counts for a metric from the store, then analyzes them.
    /// Uses the primary metric when `metric_id` is `None`.
    pub fn analyze_experiment(
        &self,
        experiment_id: &Uuid,
        metric_id: Option<&str>,
        window: Option<TimeWindow>,
        confidence_level: Option<f64>,
    ) -> ExperimentResult<ExperimentResults> {
        let experiment = self.get_experiment(experiment_id)?;
        let metric = match metric_id {
            Some(id) => experiment.metrics.iter().find(|m| m.id == id),
            None => experiment.primary_metric(),
        }
        .ok_or_else(|| {
            ExperimentError::configuration(format!(
                "experiment {experiment_id} has no metric {}",
                metric_id.unwrap_or("marked primary")
            ))
        })?;

        let counts = self
            .store
            .variant_counts(experiment_id, &metric.event_name, window)?;
        self.analyze(&experiment, &counts, confidence_level)
    }

    fn analyze(
        &self,
        experiment: &Experiment,
        counts: &[VariantCounts],
        confidence_level: Option<f64>,
    ) -> ExperimentResult<ExperimentResults> {
        let analysis = &self.config.analysis;
        let confidence_level = confidence_level.unwrap_or(analysis.default_confidence_level);
        let rng = match analysis.bayesian_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut generator = VariateGenerator::new(rng);

        let start = std::time::Instant::now();
        let results = analyze_results(experiment, counts, confidence_level, analysis, &mut generator)?;
        metrics::histogram!("experiment.analysis_latency_us")
            .record(start.elapsed().as_micros() as f64);
        Ok(results)
    }

    /// Per-variant sample size; alpha and power default to the configured
    /// confidence level and minimum power.
    pub fn calculate_sample_size(
        &self,
        baseline_rate: f64,
        minimum_detectable_effect: f64,
        alpha: Option<f64>,
        power: Option<f64>,
        num_variants: usize,
    ) -> ExperimentResult<SampleSizeEstimate> {
        let analysis = &self.config.analysis;
        calculate_multi_variant_sample_size(
            baseline_rate,
            minimum_detectable_effect,
            alpha.unwrap_or(1.0 - analysis.default_confidence_level),
            power.unwrap_or(analysis.min_power),
            num_variants,
        )
    }

    /// Checks observed per-variant sample sizes, in variant order, against the
    /// experiment's configured weights.
    pub fn detect_srm(&self, experiment_id: &Uuid, sample_sizes: &[u64]) -> ExperimentResult<SrmCheck> {
        let experiment = self.get_experiment(experiment_id)?;
        let weights: Vec<u32> = experiment.variants.iter().map(|v| v.weight).collect();
        check_sample_ratio(
            sample_sizes,
            &weights,
            self.config.analysis.srm_p_value_threshold,
        )
    }

    pub fn detect_outliers(&self, values: &[f64]) -> ExperimentResult<OutlierReport> {
        detect_outliers(values, self.config.trend.iqr_multiplier)
    }

    pub fn detect_trend(&self, values: &[f64], time_points: &[f64]) -> ExperimentResult<TrendReport> {
        detect_trend(values, time_points, self.config.trend.r_squared_significance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::types::{Metric, Variant};
    use experiment_core::InMemoryStore;

    fn service() -> ExperimentService<InMemoryStore> {
        ExperimentService::new(EngineConfig::default(), Arc::new(InMemoryStore::new()))
    }

    fn draft() -> Experiment {
        let mut experiment = Experiment::draft("Homepage hero");
        experiment.variants = vec![Variant::control("control", 50), Variant::new("video", 50)];
        experiment.metrics = vec![Metric::conversion("signup", "signup_completed").primary()];
        experiment
    }

    #[test]
    fn test_create_rejects_non_draft_and_duplicates() {
        let service = service();
        let mut active = draft();
        active.status = ExperimentStatus::Active;
        assert!(service.create_experiment(active).is_err());

        let experiment = draft();
        let copy = experiment.clone();
        service.create_experiment(experiment).unwrap();
        assert!(service.create_experiment(copy).is_err());
    }

    #[test]
    fn test_unknown_experiment_is_not_found() {
        let service = service();
        let id = Uuid::new_v4();
        assert!(matches!(service.get_experiment(&id), Err(ExperimentError::NotFound(_))));
        assert!(matches!(service.activate(&id), Err(ExperimentError::NotFound(_))));
    }

    #[test]
    fn test_lifecycle_is_persisted() {
        let service = service();
        let id = service.create_experiment(draft()).unwrap();
        service.activate(&id).unwrap();
        assert_eq!(service.get_experiment(&id).unwrap().status, ExperimentStatus::Active);
        service.pause(&id).unwrap();
        assert_eq!(service.get_experiment(&id).unwrap().status, ExperimentStatus::Paused);
        assert!(service.pause(&id).is_err());
        assert_eq!(service.get_experiment(&id).unwrap().status, ExperimentStatus::Paused);
    }

    #[test]
    fn test_defaults_drive_sample_size() {
        let service = service();
        let estimate = service.calculate_sample_size(0.1, 0.2, None, None, 2).unwrap();
        let explicit = service
            .calculate_sample_size(0.1, 0.2, Some(0.05), Some(0.8), 2)
            .unwrap();
        assert_eq!(estimate, explicit);
    }
}
