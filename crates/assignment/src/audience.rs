//! Audience targeting: exclude list, include list, property rules and the
//! percentage gate, applied in that order.

use std::cmp::Ordering;

use experiment_core::types::{
    AudienceRule, PropertyValue, RuleOperator, TargetAudience, UserContext,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hashing::audience_bucket;

/// Why a user was kept out of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Ineligibility {
    Excluded,
    NotIncluded,
    RuleMismatch { property: String },
    OutsideTrafficPercentage { bucket: u8, percentage: u32 },
}

impl std::fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligibility::Excluded => write!(f, "user is on the exclude list"),
            Ineligibility::NotIncluded => write!(f, "user is not on the include list"),
            Ineligibility::RuleMismatch { property } => {
                write!(f, "audience rule on '{property}' did not match")
            }
            Ineligibility::OutsideTrafficPercentage { bucket, percentage } => {
                write!(f, "audience bucket {bucket} is outside the {percentage}% gate")
            }
        }
    }
}

/// Checks a user against an experiment's audience. `Ok(())` means eligible.
pub fn check_audience(
    experiment_id: &Uuid,
    audience: &TargetAudience,
    user: &UserContext,
) -> Result<(), Ineligibility> {
    if audience.exclude_user_ids.iter().any(|u| *u == user.user_id) {
        return Err(Ineligibility::Excluded);
    }

    if !audience.include_user_ids.is_empty()
        && !audience.include_user_ids.iter().any(|u| *u == user.user_id)
    {
        return Err(Ineligibility::NotIncluded);
    }

    if let Some(rule) = audience.rules.iter().find(|r| !rule_matches(r, user)) {
        return Err(Ineligibility::RuleMismatch {
            property: rule.property.clone(),
        });
    }

    if let Some(percentage) = audience.percentage {
        let bucket = audience_bucket(experiment_id, &user.user_id);
        if u32::from(bucket) >= percentage {
            return Err(Ineligibility::OutsideTrafficPercentage { bucket, percentage });
        }
    }

    Ok(())
}

/// Evaluates one rule. A missing property only satisfies the negative
/// operators.
#[allow(clippy::unnecessary_map_or)]
pub fn rule_matches(rule: &AudienceRule, user: &UserContext) -> bool {
    let Some(actual) = user.properties.get(&rule.property) else {
        return matches!(
            rule.operator,
            RuleOperator::IsNotSet | RuleOperator::NotEquals | RuleOperator::NotInList
        );
    };
    let expected = rule.value.as_ref();

    match rule.operator {
        RuleOperator::IsSet => true,
        RuleOperator::IsNotSet => false,
        RuleOperator::Equals => expected.map_or(false, |e| actual == e),
        RuleOperator::NotEquals => expected.map_or(true, |e| actual != e),
        RuleOperator::GreaterThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == Ordering::Greater)
        }
        RuleOperator::GreaterThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != Ordering::Less)
        }
        RuleOperator::LessThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == Ordering::Less)
        }
        RuleOperator::LessThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != Ordering::Greater)
        }
        RuleOperator::Contains => match (actual, expected) {
            (PropertyValue::Text(a), Some(PropertyValue::Text(e))) => a.contains(e.as_str()),
            (PropertyValue::List(items), Some(e)) => items.contains(e),
            _ => false,
        },
        RuleOperator::InList => match expected {
            Some(PropertyValue::List(list)) => list.contains(actual),
            _ => false,
        },
        RuleOperator::NotInList => match expected {
            Some(PropertyValue::List(list)) => !list.contains(actual),
            _ => true,
        },
    }
}

fn numeric_cmp(actual: &PropertyValue, expected: Option<&PropertyValue>) -> Option<Ordering> {
    match (actual, expected?) {
        (PropertyValue::Number(a), PropertyValue::Number(b)) => a.partial_cmp(b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(property: &str, operator: RuleOperator, value: Option<PropertyValue>) -> AudienceRule {
        AudienceRule {
            property: property.to_string(),
            operator,
            value,
        }
    }

    fn user() -> UserContext {
        UserContext::new("user-42")
            .with_property("country", "DE")
            .with_property("sessions", 12.0)
            .with_property("beta", true)
            .with_property("plan", "pro-annual")
    }

    #[test]
    fn test_rule_operators() {
        let u = user();
        assert!(rule_matches(&rule("country", RuleOperator::Equals, Some("DE".into())), &u));
        assert!(rule_matches(&rule("country", RuleOperator::NotEquals, Some("FR".into())), &u));
        assert!(rule_matches(&rule("sessions", RuleOperator::GreaterThan, Some(10.0.into())), &u));
        assert!(rule_matches(
            &rule("sessions", RuleOperator::GreaterThanOrEqual, Some(12.0.into())),
            &u
        ));
        assert!(!rule_matches(&rule("sessions", RuleOperator::LessThan, Some(12.0.into())), &u));
        assert!(rule_matches(
            &rule("sessions", RuleOperator::LessThanOrEqual, Some(12.0.into())),
            &u
        ));
        assert!(rule_matches(&rule("plan", RuleOperator::Contains, Some("annual".into())), &u));
        assert!(rule_matches(&rule("beta", RuleOperator::IsSet, None), &u));
        assert!(rule_matches(&rule("referrer", RuleOperator::IsNotSet, None), &u));

        let countries = PropertyValue::List(vec!["DE".into(), "AT".into()]);
        assert!(rule_matches(&rule("country", RuleOperator::InList, Some(countries.clone())), &u));
        assert!(!rule_matches(&rule("country", RuleOperator::NotInList, Some(countries)), &u));
    }

    #[test]
    fn test_type_mismatch_never_matches_ordering() {
        let u = user();
        assert!(!rule_matches(&rule("country", RuleOperator::GreaterThan, Some(1.0.into())), &u));
        assert!(!rule_matches(&rule("sessions", RuleOperator::Equals, None), &u));
    }

    #[test]
    fn test_missing_property() {
        let u = UserContext::new("anon");
        assert!(!rule_matches(&rule("country", RuleOperator::Equals, Some("DE".into())), &u));
        assert!(rule_matches(&rule("country", RuleOperator::NotEquals, Some("DE".into())), &u));
        assert!(!rule_matches(&rule("country", RuleOperator::IsSet, None), &u));
    }

    #[test]
    fn test_audience_order() {
        let experiment_id = Uuid::new_v4();
        let audience = TargetAudience {
            percentage: None,
            include_user_ids: vec!["user-42".to_string(), "user-7".to_string()],
            exclude_user_ids: vec!["user-42".to_string()],
            rules: vec![rule("country", RuleOperator::Equals, Some("DE".into()))],
        };

        assert_eq!(
            check_audience(&experiment_id, &audience, &user()),
            Err(Ineligibility::Excluded)
        );
        assert_eq!(
            check_audience(&experiment_id, &audience, &UserContext::new("user-9")),
            Err(Ineligibility::NotIncluded)
        );
        assert_eq!(
            check_audience(
                &experiment_id,
                &audience,
                &UserContext::new("user-7").with_property("country", "FR")
            ),
            Err(Ineligibility::RuleMismatch {
                property: "country".to_string()
            })
        );
        assert!(check_audience(
            &experiment_id,
            &audience,
            &UserContext::new("user-7").with_property("country", "DE")
        )
        .is_ok());
    }

    #[test]
    fn test_percentage_gate() {
        let experiment_id = Uuid::new_v4();
        let closed = TargetAudience {
            percentage: Some(0),
            ..TargetAudience::default()
        };
        let open = TargetAudience {
            percentage: Some(100),
            ..TargetAudience::default()
        };
        let half = TargetAudience {
            percentage: Some(50),
            ..TargetAudience::default()
        };

        let users: Vec<UserContext> = (0..10_000)
            .map(|i| UserContext::new(&format!("user-{i}")))
            .collect();
        assert!(users
            .iter()
            .all(|u| check_audience(&experiment_id, &closed, u).is_err()));
        assert!(users
            .iter()
            .all(|u| check_audience(&experiment_id, &open, u).is_ok()));

        let admitted = users
            .iter()
            .filter(|u| check_audience(&experiment_id, &half, u).is_ok())
            .count();
        assert!((4_700..=5_300).contains(&admitted), "admitted {admitted}");
    }
}
