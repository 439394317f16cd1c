//! Storage boundary for experiments, assignments, overrides and events.
//!
//! The engine only ever talks to [`ExperimentStore`]. Production deployments
//! back it with a database that enforces uniqueness on (user, experiment);
//! [`InMemoryStore`] provides the same API surface for development and tests.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ExperimentError, ExperimentResult};
use crate::types::{
    Experiment, ExperimentEvent, ExperimentOverride, TimeWindow, UserAssignment, VariantCounts,
};

pub trait ExperimentStore: Send + Sync {
    fn get_experiment(&self, id: &Uuid) -> ExperimentResult<Option<Experiment>>;

    fn save_experiment(&self, experiment: Experiment) -> ExperimentResult<()>;

    fn get_assignment(
        &self,
        user_id: &str,
        experiment_id: &Uuid,
    ) -> ExperimentResult<Option<UserAssignment>>;

    /// Persists the assignment unless one already exists for the same
    /// (user, experiment); returns whichever record is stored afterwards.
    fn insert_assignment_if_absent(
        &self,
        assignment: UserAssignment,
    ) -> ExperimentResult<UserAssignment>;

    fn replace_assignment(&self, assignment: UserAssignment) -> ExperimentResult<UserAssignment>;

    fn add_override(&self, override_: ExperimentOverride) -> ExperimentResult<Uuid>;

    /// Unexpired overrides that apply to the user within the experiment.
    fn active_overrides(
        &self,
        experiment_id: &Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> ExperimentResult<Vec<ExperimentOverride>>;

    fn append_event(&self, event: ExperimentEvent) -> ExperimentResult<()>;

    /// Per-variant exposure and conversion counts for one source event.
    /// A conversion counts only when the user's stored assignment is the
    /// event's variant, so conversions never exceed exposures.
    fn variant_counts(
        &self,
        experiment_id: &Uuid,
        event_name: &str,
        window: Option<TimeWindow>,
    ) -> ExperimentResult<Vec<VariantCounts>>;
}

/// Thread-safe in-memory store backed by DashMap.
pub struct InMemoryStore {
    experiments: DashMap<Uuid, Experiment>,
    assignments: DashMap<(Uuid, String), UserAssignment>,
    overrides: DashMap<Uuid, ExperimentOverride>,
    events: DashMap<Uuid, Vec<ExperimentEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Experiment store initialized (in-memory, development mode)");
        Self {
            experiments: DashMap::new(),
            assignments: DashMap::new(),
            overrides: DashMap::new(),
            events: DashMap::new(),
        }
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn event_count(&self, experiment_id: &Uuid) -> usize {
        self.events.get(experiment_id).map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentStore for InMemoryStore {
    fn get_experiment(&self, id: &Uuid) -> ExperimentResult<Option<Experiment>> {
        Ok(self.experiments.get(id).map(|r| r.value().clone()))
    }

    fn save_experiment(&self, experiment: Experiment) -> ExperimentResult<()> {
        debug!(experiment_id = %experiment.id, status = %experiment.status, "Saving experiment");
        self.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    fn get_assignment(
        &self,
        user_id: &str,
        experiment_id: &Uuid,
    ) -> ExperimentResult<Option<UserAssignment>> {
        Ok(self
            .assignments
            .get(&(*experiment_id, user_id.to_string()))
            .map(|r| r.value().clone()))
    }

    fn insert_assignment_if_absent(
        &self,
        assignment: UserAssignment,
    ) -> ExperimentResult<UserAssignment> {
        let key = (assignment.experiment_id, assignment.user_id.clone());
        match self.assignments.entry(key) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => Ok(slot.insert(assignment).value().clone()),
        }
    }

    fn replace_assignment(&self, assignment: UserAssignment) -> ExperimentResult<UserAssignment> {
        let key = (assignment.experiment_id, assignment.user_id.clone());
        self.assignments.insert(key, assignment.clone());
        Ok(assignment)
    }

    fn add_override(&self, override_: ExperimentOverride) -> ExperimentResult<Uuid> {
        if override_.user_id.is_none() && override_.experiment_id.is_none() {
            return Err(ExperimentError::configuration(
                "override must name a user, an experiment, or both",
            ));
        }
        let id = Uuid::new_v4();
        self.overrides.insert(id, override_);
        Ok(id)
    }

    fn active_overrides(
        &self,
        experiment_id: &Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> ExperimentResult<Vec<ExperimentOverride>> {
        Ok(self
            .overrides
            .iter()
            .filter(|o| !o.is_expired(now) && o.applies_to(user_id, experiment_id))
            .map(|o| o.value().clone())
            .collect())
    }

    fn append_event(&self, event: ExperimentEvent) -> ExperimentResult<()> {
        self.events
            .entry(event.experiment_id)
            .or_default()
            .push(event);
        Ok(())
    }

    fn variant_counts(
        &self,
        experiment_id: &Uuid,
        event_name: &str,
        window: Option<TimeWindow>,
    ) -> ExperimentResult<Vec<VariantCounts>> {
        let experiment = self
            .experiments
            .get(experiment_id)
            .map(|r| r.value().clone())
            .ok_or(ExperimentError::NotFound(*experiment_id))?;

        let mut exposed: HashMap<String, u64> = HashMap::new();
        let mut assigned: HashMap<String, String> = HashMap::new();
        for entry in self.assignments.iter() {
            let a = entry.value();
            if a.experiment_id != *experiment_id {
                continue;
            }
            if window.is_some_and(|w| a.assigned_at > w.end) {
                continue;
            }
            *exposed.entry(a.variant_id.clone()).or_insert(0) += 1;
            assigned.insert(a.user_id.clone(), a.variant_id.clone());
        }

        let mut converted: HashMap<String, HashSet<String>> = HashMap::new();
        if let Some(events) = self.events.get(experiment_id) {
            for event in events.iter() {
                if event.event_name != event_name {
                    continue;
                }
                if window.is_some_and(|w| !w.contains(event.timestamp)) {
                    continue;
                }
                // Only conversions backed by a counted exposure to the same arm
                if assigned.get(&event.user_id) != Some(&event.variant_id) {
                    continue;
                }
                converted
                    .entry(event.variant_id.clone())
                    .or_default()
                    .insert(event.user_id.clone());
            }
        }

        Ok(experiment
            .variants
            .iter()
            .map(|v| VariantCounts {
                variant_id: v.id.clone(),
                sample_size: exposed.get(&v.id).copied().unwrap_or(0),
                conversions: converted.get(&v.id).map(|u| u.len() as u64).unwrap_or(0),
            })
            .collect())
    }
}
