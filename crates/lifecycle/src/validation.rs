use std::collections::HashSet;

use chrono::{DateTime, Utc};
use experiment_core::types::Experiment;
use experiment_core::{ValidationError, ValidationIssue};
use serde::{Deserialize, Serialize};

/// Outcome of checking an experiment definition against its invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: issues.is_empty(),
            issues,
        }
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_valid {
            Ok(())
        } else {
            Err(ValidationError {
                issues: self.issues,
            })
        }
    }
}

/// Collects every structural invariant the experiment violates.
pub fn validate_experiment(experiment: &Experiment) -> ValidationReport {
    ValidationReport::from_issues(structural_issues(experiment))
}

/// Structural checks plus the activation-time start date gate.
pub(crate) fn validate_for_activation(
    experiment: &Experiment,
    now: DateTime<Utc>,
) -> ValidationReport {
    let mut issues = structural_issues(experiment);
    if experiment.start_date.is_some_and(|start| start > now) {
        issues.push(ValidationIssue::StartInFuture);
    }
    ValidationReport::from_issues(issues)
}

fn structural_issues(experiment: &Experiment) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if experiment.name.trim().is_empty() {
        issues.push(ValidationIssue::EmptyName);
    }

    if experiment.variants.len() < 2 {
        issues.push(ValidationIssue::TooFewVariants {
            count: experiment.variants.len(),
        });
    }

    let mut seen = HashSet::new();
    for variant in &experiment.variants {
        if variant.id.trim().is_empty() {
            issues.push(ValidationIssue::EmptyVariantId);
        } else if !seen.insert(variant.id.as_str()) {
            issues.push(ValidationIssue::DuplicateVariantId {
                variant_id: variant.id.clone(),
            });
        }
        if variant.weight > 100 {
            issues.push(ValidationIssue::WeightOutOfRange {
                variant_id: variant.id.clone(),
                weight: variant.weight,
            });
        }
    }

    let total = experiment.total_weight();
    if total != 100 {
        issues.push(ValidationIssue::WeightSum { total });
    }

    let controls = experiment.variants.iter().filter(|v| v.is_control).count();
    if controls > 1 {
        issues.push(ValidationIssue::MultipleControls { count: controls });
    }

    if experiment.primary_metric().is_none() {
        issues.push(ValidationIssue::NoPrimaryMetric);
    }

    if let (Some(start), Some(end)) = (experiment.start_date, experiment.end_date) {
        if end <= start {
            issues.push(ValidationIssue::EndBeforeStart);
        }
    }

    if let Some(audience) = &experiment.target_audience {
        if let Some(percentage) = audience.percentage.filter(|p| *p > 100) {
            issues.push(ValidationIssue::AudiencePercentageOutOfRange { percentage });
        }
        if audience.rules.iter().any(|r| r.property.trim().is_empty()) {
            issues.push(ValidationIssue::EmptyRuleProperty);
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use experiment_core::types::{AudienceRule, Metric, RuleOperator, TargetAudience, Variant};

    fn valid_experiment() -> Experiment {
        let mut experiment = Experiment::draft("Onboarding checklist");
        experiment.variants = vec![Variant::control("control", 50), Variant::new("checklist", 50)];
        experiment.metrics = vec![Metric::conversion("activation", "project_created").primary()];
        experiment
    }

    #[test]
    fn test_valid_experiment_passes() {
        let report = validate_experiment(&valid_experiment());
        assert!(report.is_valid);
        assert!(report.issues.is_empty());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_weight_sum_rejected() {
        let mut experiment = valid_experiment();
        experiment.variants[1].weight = 40;
        let report = validate_experiment(&experiment);
        assert!(!report.is_valid);
        assert_eq!(report.issues, vec![ValidationIssue::WeightSum { total: 90 }]);

        experiment.variants[1].weight = 60;
        assert!(validate_experiment(&experiment)
            .issues
            .contains(&ValidationIssue::WeightSum { total: 110 }));
    }

    #[test]
    fn test_huge_weights_reported_not_wrapped() {
        let mut experiment = valid_experiment();
        experiment.variants[0].weight = u32::MAX;
        experiment.variants[1].weight = 101;
        let issues = validate_experiment(&experiment).issues;
        assert!(issues.contains(&ValidationIssue::WeightSum {
            total: u64::from(u32::MAX) + 101
        }));
        assert_eq!(
            issues
                .iter()
                .filter(|i| matches!(i, ValidationIssue::WeightOutOfRange { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_reports_every_issue() {
        let mut experiment = Experiment::draft("  ");
        experiment.variants = vec![
            Variant::control("a", 120),
            Variant::control("a", 10),
        ];
        experiment.start_date = Some(Utc::now());
        experiment.end_date = Some(Utc::now() - Duration::days(1));
        experiment.target_audience = Some(TargetAudience {
            percentage: Some(150),
            rules: vec![AudienceRule {
                property: String::new(),
                operator: RuleOperator::IsSet,
                value: None,
            }],
            ..TargetAudience::default()
        });

        let issues = validate_experiment(&experiment).issues;
        assert!(issues.contains(&ValidationIssue::EmptyName));
        assert!(issues.contains(&ValidationIssue::DuplicateVariantId {
            variant_id: "a".to_string()
        }));
        assert!(issues.contains(&ValidationIssue::WeightOutOfRange {
            variant_id: "a".to_string(),
            weight: 120
        }));
        assert!(issues.contains(&ValidationIssue::WeightSum { total: 130 }));
        assert!(issues.contains(&ValidationIssue::MultipleControls { count: 2 }));
        assert!(issues.contains(&ValidationIssue::NoPrimaryMetric));
        assert!(issues.contains(&ValidationIssue::EndBeforeStart));
        assert!(issues.contains(&ValidationIssue::AudiencePercentageOutOfRange { percentage: 150 }));
        assert!(issues.contains(&ValidationIssue::EmptyRuleProperty));
        assert_eq!(issues.len(), 9);
    }

    #[test]
    fn test_single_variant_rejected() {
        let mut experiment = valid_experiment();
        experiment.variants = vec![Variant::control("control", 100)];
        assert_eq!(
            validate_experiment(&experiment).issues,
            vec![ValidationIssue::TooFewVariants { count: 1 }]
        );
    }

    #[test]
    fn test_future_start_only_blocks_activation() {
        let now = Utc::now();
        let mut experiment = valid_experiment();
        experiment.start_date = Some(now + Duration::days(2));

        assert!(validate_experiment(&experiment).is_valid);
        assert_eq!(
            validate_for_activation(&experiment, now).issues,
            vec![ValidationIssue::StartInFuture]
        );
    }
}
