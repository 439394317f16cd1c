use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Experiments ────────────────────────────────────────────────────────
/// A/B/n experiment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    /// Evaluated in declaration order when walking weight ranges.
    pub variants: Vec<Variant>,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target_audience: Option<TargetAudience>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    /// Creates an empty draft experiment.
    pub fn draft(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            status: ExperimentStatus::Draft,
            variants: Vec::new(),
            metrics: Vec::new(),
            start_date: None,
            end_date: None,
            target_audience: None,
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// The flagged control, or the first variant when none is flagged.
    pub fn control(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| v.is_control)
            .or_else(|| self.variants.first())
    }

    pub fn primary_metric(&self) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.is_primary)
    }

    /// Sum of variant weights, widened to `u64`.
    pub fn total_weight(&self) -> u64 {
        self.variants.iter().map(|v| u64::from(v.weight)).sum()
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end <= now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Archived)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// One arm of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    /// Percentage of eligible traffic, 0–100.
    pub weight: u32,
    #[serde(default)]
    pub config: Option<VariantPayload>,
    #[serde(default)]
    pub is_control: bool,
}

impl Variant {
    pub fn new(id: &str, weight: u32) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            weight,
            config: None,
            is_control: false,
        }
    }

    pub fn control(id: &str, weight: u32) -> Self {
        Self {
            is_control: true,
            ..Self::new(id, weight)
        }
    }
}

/// Configuration delivered to users bucketed into a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum VariantPayload {
    FeatureFlags {
        flags: HashMap<String, bool>,
    },
    Content {
        fields: HashMap<String, String>,
    },
    Pricing {
        amount: f64,
        currency: String,
    },
    Redirect {
        url: String,
    },
    /// Passed through to the caller untouched.
    Opaque {
        value: serde_json::Value,
    },
}

/// A measured outcome of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub name: String,
    pub metric_type: MetricType,
    /// Source event counted towards this metric.
    pub event_name: String,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub success_threshold: Option<f64>,
    #[serde(default)]
    pub is_primary: bool,
}

impl Metric {
    pub fn conversion(id: &str, event_name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            metric_type: MetricType::Conversion,
            event_name: event_name.to_string(),
            aggregation: Aggregation::Count,
            success_threshold: None,
            is_primary: false,
        }
    }

    pub fn primary(self) -> Self {
        Self {
            is_primary: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Conversion,
    Retention,
    Engagement,
    Revenue,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Count,
    Average,
    Median,
    Percentage,
}

// ─── Targeting ──────────────────────────────────────────────────────────
/// Who may enter an experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetAudience {
    /// Share of otherwise-eligible users admitted, 0–100.
    #[serde(default)]
    pub percentage: Option<u32>,
    /// When non-empty, only these users are eligible.
    #[serde(default)]
    pub include_user_ids: Vec<String>,
    #[serde(default)]
    pub exclude_user_ids: Vec<String>,
    #[serde(default)]
    pub rules: Vec<AudienceRule>,
}

/// A predicate over one user property; all rules of an audience must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceRule {
    pub property: String,
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: Option<PropertyValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    InList,
    NotInList,
    IsSet,
    IsNotSet,
}

/// Typed user property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<PropertyValue>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// The user being assigned, with the properties audience rules look at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
}

impl UserContext {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

// ─── Assignments ────────────────────────────────────────────────────────
/// Outcome of bucketing a user into an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAssignment {
    pub user_id: String,
    pub experiment_id: Uuid,
    pub variant_id: String,
    pub assigned_at: DateTime<Utc>,
    /// Hash bucket in [0, 100).
    pub traffic_bucket: u8,
    #[serde(default)]
    pub should_reassign: bool,
    pub source: AssignmentSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Hashed,
    Override,
}

/// Operator-forced variant for a user, an experiment, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentOverride {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<Uuid>,
    pub variant_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ExperimentOverride {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether this override targets the given user within the given experiment.
    #[allow(clippy::unnecessary_map_or)]
    pub fn applies_to(&self, user_id: &str, experiment_id: &Uuid) -> bool {
        if self.user_id.is_none() && self.experiment_id.is_none() {
            return false;
        }
        self.user_id.as_deref().map_or(true, |u| u == user_id)
            && self.experiment_id.map_or(true, |e| e == *experiment_id)
    }

    /// Higher is more specific; user+experiment beats either alone.
    pub fn specificity(&self) -> u8 {
        u8::from(self.user_id.is_some()) * 2 + u8::from(self.experiment_id.is_some())
    }
}

// ─── Events & aggregates ────────────────────────────────────────────────
/// Append-only outcome event attributed to a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: String,
    pub user_id: String,
    pub event_name: String,
    #[serde(default)]
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ExperimentEvent {
    pub fn new(experiment_id: Uuid, variant_id: &str, user_id: &str, event_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            variant_id: variant_id.to_string(),
            user_id: user_id.to_string(),
            event_name: event_name.to_string(),
            value: None,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregated exposure and conversion counts for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantCounts {
    pub variant_id: String,
    pub sample_size: u64,
    pub conversions: u64,
}

impl VariantCounts {
    pub fn new(variant_id: &str, sample_size: u64, conversions: u64) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            sample_size,
            conversions,
        }
    }

    /// Observed conversion rate; `None` when nobody was exposed.
    pub fn rate(&self) -> Option<f64> {
        (self.sample_size > 0).then(|| self.conversions as f64 / self.sample_size as f64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_control_falls_back_to_first_variant() {
        let mut experiment = Experiment::draft("Checkout copy");
        experiment.variants = vec![Variant::new("a", 50), Variant::new("b", 50)];
        assert_eq!(experiment.control().unwrap().id, "a");

        experiment.variants[1].is_control = true;
        assert_eq!(experiment.control().unwrap().id, "b");
    }

    #[test]
    fn test_override_matching_and_specificity() {
        let experiment_id = Uuid::new_v4();
        let both = ExperimentOverride {
            user_id: Some("u1".to_string()),
            experiment_id: Some(experiment_id),
            variant_id: "b".to_string(),
            expires_at: None,
            reason: None,
        };
        let user_only = ExperimentOverride {
            experiment_id: None,
            ..both.clone()
        };
        let neither = ExperimentOverride {
            user_id: None,
            experiment_id: None,
            ..both.clone()
        };

        assert!(both.applies_to("u1", &experiment_id));
        assert!(!both.applies_to("u2", &experiment_id));
        assert!(!both.applies_to("u1", &Uuid::new_v4()));
        assert!(user_only.applies_to("u1", &Uuid::new_v4()));
        assert!(!neither.applies_to("u1", &experiment_id));
        assert!(both.specificity() > user_only.specificity());
    }

    #[test]
    fn test_override_expiry() {
        let now = Utc::now();
        let ov = ExperimentOverride {
            user_id: Some("u1".to_string()),
            experiment_id: None,
            variant_id: "a".to_string(),
            expires_at: Some(now - Duration::minutes(1)),
            reason: Some("qa".to_string()),
        };
        assert!(ov.is_expired(now));
    }

    #[test]
    fn test_variant_payload_serde_tagging() {
        let payload = VariantPayload::Pricing {
            amount: 9.99,
            currency: "USD".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "pricing");

        let opaque: VariantPayload =
            serde_json::from_value(serde_json::json!({"kind": "opaque", "value": {"x": 1}}))
                .unwrap();
        assert!(matches!(opaque, VariantPayload::Opaque { .. }));
    }

    #[test]
    fn test_property_value_untagged() {
        let ctx: UserContext = serde_json::from_value(serde_json::json!({
            "user_id": "u1",
            "properties": {"country": "US", "age": 31, "beta": true, "tags": ["a", "b"]}
        }))
        .unwrap();
        assert_eq!(ctx.properties["country"], PropertyValue::from("US"));
        assert_eq!(ctx.properties["age"], PropertyValue::Number(31.0));
        assert_eq!(ctx.properties["beta"], PropertyValue::Bool(true));
        assert!(matches!(ctx.properties["tags"], PropertyValue::List(_)));
    }

    #[test]
    fn test_variant_counts_rate() {
        assert_eq!(VariantCounts::new("a", 0, 0).rate(), None);
        assert_eq!(VariantCounts::new("a", 200, 50).rate(), Some(0.25));
    }
}
