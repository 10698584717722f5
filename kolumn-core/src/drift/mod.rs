//! Drift - Compare recorded resource attributes with observed attributes
//!
//! The detector emits one [`DriftItem`] per divergent field and picks a
//! [`ResolutionStrategy`] for the whole resource. Observation is delegated to
//! a [`ResourceObserver`]; the detector itself performs no I/O.

mod resolve;

pub use resolve::{DriftResolver, FailedAction, FieldTarget, ResolutionAction, ResolutionReport};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::provider::{Observation, ProviderError, ResourceObserver};
use crate::resource::{Attributes, Instance, Resource};

/// Fields whose drift can be written back to state without prompting
pub const AUTO_RESOLVABLE_FIELDS: &[&str] = &["description", "tags", "labels", "metadata"];

const IDENTITY_FIELDS: &[&str] = &["name", "type", "provider"];
const CONFIG_FIELDS: &[&str] = &["config", "settings", "policy"];

/// Placeholder shown instead of sensitive values
pub const SENSITIVE_PLACEHOLDER: &str = "(sensitive)";

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("Failed to observe {resource}: {source}")]
    Observe {
        resource: String,
        #[source]
        source: ProviderError,
    },
}

pub type DriftResult<T> = Result<T, DriftError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Medium,
    High,
    Critical,
}

impl DriftSeverity {
    /// Severity of a divergence in the given field
    pub fn for_field(field: &str) -> Self {
        let field = field.to_ascii_lowercase();
        if IDENTITY_FIELDS.contains(&field.as_str()) {
            DriftSeverity::Critical
        } else if CONFIG_FIELDS
            .iter()
            .any(|c| field == *c || field.ends_with(&format!("_{}", c)))
        {
            DriftSeverity::High
        } else {
            DriftSeverity::Medium
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Nothing to do
    Ignore,
    /// Write the observed values back into state
    UpdateState,
    /// A human has to decide
    PromptUser,
}

/// One divergent field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftItem {
    pub resource_id: String,
    /// Instance index within the resource
    pub instance: usize,
    pub field: String,
    pub recorded: Value,
    pub observed: Value,
    pub severity: DriftSeverity,
    /// Certainty in [0, 1] that the divergence is real
    pub confidence: f64,
    pub auto_resolvable: bool,
}

/// Drift found for one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftAnalysis {
    pub resource_id: String,
    pub has_drift: bool,
    pub items: Vec<DriftItem>,
    pub strategy: ResolutionStrategy,
    /// Mean confidence of the auto-resolvable items
    pub auto_resolve_confidence: f64,
    pub detected_at: DateTime<Utc>,
}

impl DriftAnalysis {
    pub fn auto_resolvable_items(&self) -> impl Iterator<Item = &DriftItem> {
        self.items.iter().filter(|i| i.auto_resolvable)
    }

    pub fn max_severity(&self) -> Option<DriftSeverity> {
        self.items.iter().map(|i| i.severity).max()
    }
}

/// Detector configuration
#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Minimum auto-resolve confidence for [`ResolutionStrategy::UpdateState`]
    pub auto_resolve_threshold: f64,
    /// Fields never compared
    pub ignored_fields: BTreeSet<String>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            auto_resolve_threshold: 0.8,
            ignored_fields: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    config: DriftConfig,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Observe one resource and compare it with its recorded attributes
    pub async fn detect(
        &self,
        resource: &Resource,
        observer: &dyn ResourceObserver,
    ) -> DriftResult<DriftAnalysis> {
        let observation = observer
            .observe(resource)
            .await
            .map_err(|source| DriftError::Observe {
                resource: resource.id(),
                source,
            })?;
        Ok(self.compare(resource, &observation))
    }

    /// Run [`detect`](Self::detect) over every resource, in order
    pub async fn detect_all(
        &self,
        resources: &[Resource],
        observer: &dyn ResourceObserver,
    ) -> DriftResult<Vec<DriftAnalysis>> {
        let mut analyses = Vec::with_capacity(resources.len());
        for resource in resources {
            analyses.push(self.detect(resource, observer).await?);
        }
        let drifted = analyses.iter().filter(|a| a.has_drift).count();
        log::info!(
            "Drift detection via {}: {} of {} resources drifted",
            observer.name(),
            drifted,
            analyses.len()
        );
        Ok(analyses)
    }

    /// Compare recorded state against an observation
    pub fn compare(&self, resource: &Resource, observation: &Observation) -> DriftAnalysis {
        let resource_id = resource.id();
        let mut items = Vec::new();

        if !observation.exists {
            items.push(DriftItem {
                resource_id: resource_id.clone(),
                instance: 0,
                field: "exists".to_string(),
                recorded: Value::Bool(true),
                observed: Value::Bool(false),
                severity: DriftSeverity::Critical,
                confidence: 0.95,
                auto_resolvable: false,
            });
        } else {
            let empty = Attributes::new();
            for (index, instance) in resource.instances.iter().enumerate() {
                let observed = observation.instances.get(index).unwrap_or(&empty);
                self.compare_instance(&resource_id, index, instance, observed, &mut items);
            }
        }

        let (strategy, auto_resolve_confidence) = self.select_strategy(&items);

        DriftAnalysis {
            has_drift: !items.is_empty(),
            resource_id,
            items,
            strategy,
            auto_resolve_confidence,
            detected_at: Utc::now(),
        }
    }

    fn compare_instance(
        &self,
        resource_id: &str,
        index: usize,
        instance: &Instance,
        observed: &Attributes,
        items: &mut Vec<DriftItem>,
    ) {
        let fields: BTreeSet<&String> = instance.attributes.keys().chain(observed.keys()).collect();

        for field in fields {
            // Skip internal attributes (starting with _)
            if field.starts_with('_') || self.config.ignored_fields.contains(field.as_str()) {
                continue;
            }

            let recorded = instance.attributes.get(field).unwrap_or(&Value::Null);
            let current = observed.get(field).unwrap_or(&Value::Null);
            let Some(confidence) = divergence_confidence(recorded, current) else {
                continue;
            };

            let sensitive = instance.is_sensitive(field);
            let (recorded, current) = if sensitive {
                (json!(SENSITIVE_PLACEHOLDER), json!(SENSITIVE_PLACEHOLDER))
            } else {
                (recorded.clone(), current.clone())
            };

            items.push(DriftItem {
                resource_id: resource_id.to_string(),
                instance: index,
                field: field.clone(),
                recorded,
                observed: current,
                severity: DriftSeverity::for_field(field),
                confidence,
                auto_resolvable: !sensitive && AUTO_RESOLVABLE_FIELDS.contains(&field.as_str()),
            });
        }
    }

    /// Pick a strategy and report the mean confidence of the auto-resolvable items
    pub fn select_strategy(&self, items: &[DriftItem]) -> (ResolutionStrategy, f64) {
        if items.is_empty() {
            return (ResolutionStrategy::Ignore, 0.0);
        }

        let auto: Vec<&DriftItem> = items.iter().filter(|i| i.auto_resolvable).collect();
        let auto_confidence = if auto.is_empty() {
            0.0
        } else {
            auto.iter().map(|i| i.confidence).sum::<f64>() / auto.len() as f64
        };

        let severe = items.iter().any(|i| i.severity >= DriftSeverity::High);
        let strategy = if severe || auto.len() * 2 < items.len() {
            ResolutionStrategy::PromptUser
        } else if auto_confidence >= self.config.auto_resolve_threshold {
            ResolutionStrategy::UpdateState
        } else {
            ResolutionStrategy::PromptUser
        };

        (strategy, auto_confidence)
    }
}

/// Confidence that two values really differ, `None` when they are equal
fn divergence_confidence(recorded: &Value, observed: &Value) -> Option<f64> {
    if recorded == observed {
        return None;
    }
    match (recorded, observed) {
        (Value::Null, _) | (_, Value::Null) => Some(0.9),
        _ if value_kind(recorded) != value_kind(observed) => Some(0.95),
        _ => Some(0.8),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SnapshotObserver;
    use crate::resource::InstanceStatus;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn bucket(attributes: Value) -> Resource {
        let mut instance = Instance::new(InstanceStatus::Ready);
        instance.attributes = attrs(attributes);
        Resource::new("s3", "bucket", "logs").with_instance(instance)
    }

    #[test]
    fn identical_attributes_have_no_drift() {
        let resource = bucket(json!({"region": "eu-west-1", "tags": {"team": "data"}}));
        let observation = Observation::existing(vec![attrs(
            json!({"region": "eu-west-1", "tags": {"team": "data"}}),
        )]);

        let analysis = DriftDetector::default().compare(&resource, &observation);
        assert!(!analysis.has_drift);
        assert!(analysis.items.is_empty());
        assert_eq!(analysis.strategy, ResolutionStrategy::Ignore);
    }

    #[test]
    fn changed_tags_are_auto_resolvable() {
        let resource = bucket(json!({"region": "eu-west-1", "tags": {"team": "data"}}));
        let observation = Observation::existing(vec![attrs(
            json!({"region": "eu-west-1", "tags": {"team": "platform"}}),
        )]);

        let analysis = DriftDetector::default().compare(&resource, &observation);
        assert!(analysis.has_drift);
        assert_eq!(analysis.items.len(), 1);

        let item = &analysis.items[0];
        assert_eq!(item.field, "tags");
        assert!(item.auto_resolvable);
        assert_eq!(item.severity, DriftSeverity::Medium);
        assert_eq!(item.confidence, 0.8);
        assert_eq!(analysis.strategy, ResolutionStrategy::UpdateState);
    }

    #[test]
    fn confidence_reflects_kind_of_difference() {
        assert_eq!(divergence_confidence(&json!(1), &json!(1)), None);
        assert_eq!(divergence_confidence(&json!(1), &json!("1")), Some(0.95));
        assert_eq!(divergence_confidence(&Value::Null, &json!("x")), Some(0.9));
        assert_eq!(divergence_confidence(&json!("a"), &json!("b")), Some(0.8));
    }

    #[test]
    fn severity_by_field_class() {
        assert_eq!(DriftSeverity::for_field("name"), DriftSeverity::Critical);
        assert_eq!(DriftSeverity::for_field("Provider"), DriftSeverity::Critical);
        assert_eq!(DriftSeverity::for_field("policy"), DriftSeverity::High);
        assert_eq!(DriftSeverity::for_field("bucket_policy"), DriftSeverity::High);
        assert_eq!(DriftSeverity::for_field("retention"), DriftSeverity::Medium);
    }

    #[test]
    fn high_severity_requires_prompt() {
        let resource = bucket(json!({"tags": {}, "config": {"versioning": true}}));
        let observation = Observation::existing(vec![attrs(
            json!({"tags": {"a": "b"}, "config": {"versioning": false}}),
        )]);

        let analysis = DriftDetector::default().compare(&resource, &observation);
        assert_eq!(analysis.items.len(), 2);
        assert_eq!(analysis.strategy, ResolutionStrategy::PromptUser);
        assert_eq!(analysis.max_severity(), Some(DriftSeverity::High));
    }

    #[test]
    fn mostly_manual_items_require_prompt() {
        let resource = bucket(json!({"retention": 7, "replicas": 2, "labels": ["x"]}));
        let observation = Observation::existing(vec![attrs(
            json!({"retention": 14, "replicas": 3, "labels": ["y"]}),
        )]);

        let analysis = DriftDetector::default().compare(&resource, &observation);
        assert_eq!(analysis.items.len(), 3);
        assert_eq!(analysis.auto_resolvable_items().count(), 1);
        assert_eq!(analysis.strategy, ResolutionStrategy::PromptUser);
    }

    #[test]
    fn threshold_is_configurable() {
        let resource = bucket(json!({"description": "old"}));
        let observation = Observation::existing(vec![attrs(json!({"description": "new"}))]);

        let strict = DriftDetector::new(DriftConfig {
            auto_resolve_threshold: 0.9,
            ..DriftConfig::default()
        });
        let analysis = strict.compare(&resource, &observation);
        assert_eq!(analysis.strategy, ResolutionStrategy::PromptUser);
        assert_eq!(analysis.auto_resolve_confidence, 0.8);
    }

    #[test]
    fn internal_and_ignored_fields_are_skipped() {
        let resource = bucket(json!({"_etag": "1", "updated": "mon"}));
        let observation = Observation::existing(vec![attrs(json!({"_etag": "2", "updated": "tue"}))]);

        let detector = DriftDetector::new(DriftConfig {
            ignored_fields: ["updated".to_string()].into_iter().collect(),
            ..DriftConfig::default()
        });
        assert!(!detector.compare(&resource, &observation).has_drift);
    }

    #[test]
    fn sensitive_values_are_masked() {
        let mut resource = bucket(json!({"password": "old"}));
        resource.instances[0] = resource.instances[0].clone().with_sensitive("password");
        let observation = Observation::existing(vec![attrs(json!({"password": "new"}))]);

        let analysis = DriftDetector::default().compare(&resource, &observation);
        assert_eq!(analysis.items[0].recorded, json!(SENSITIVE_PLACEHOLDER));
        assert_eq!(analysis.items[0].observed, json!(SENSITIVE_PLACEHOLDER));
        assert!(!analysis.items[0].auto_resolvable);
    }

    #[test]
    fn missing_resource_is_critical() {
        let resource = bucket(json!({"region": "eu-west-1"}));
        let analysis = DriftDetector::default().compare(&resource, &Observation::not_found());
        assert_eq!(analysis.items.len(), 1);
        assert_eq!(analysis.items[0].field, "exists");
        assert_eq!(analysis.items[0].severity, DriftSeverity::Critical);
        assert_eq!(analysis.strategy, ResolutionStrategy::PromptUser);
    }

    #[tokio::test]
    async fn detect_all_uses_observer() {
        let resources = vec![
            bucket(json!({"tags": {"team": "data"}})),
            Resource::new("s3", "bucket", "gone")
                .with_instance(Instance::new(InstanceStatus::Ready)),
        ];
        let observer = SnapshotObserver::new().with_resource(
            "s3.bucket.logs",
            vec![attrs(json!({"tags": {"team": "data"}}))],
        );

        let analyses = DriftDetector::default()
            .detect_all(&resources, &observer)
            .await
            .unwrap();
        assert_eq!(analyses.len(), 2);
        assert!(!analyses[0].has_drift);
        assert!(analyses[1].has_drift);
    }

    /// Fails for one resource ID and counts every call
    struct FailingObserver {
        fail_on: &'static str,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ResourceObserver for FailingObserver {
        fn name(&self) -> &str {
            "failing"
        }

        fn observe<'a>(
            &'a self,
            resource: &'a Resource,
        ) -> crate::provider::BoxFuture<'a, crate::provider::ProviderResult<Observation>> {
            Box::pin(async move {
                self.calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if resource.id() == self.fail_on {
                    Err(ProviderError::new("connection refused").for_resource(resource.id()))
                } else {
                    Ok(Observation::existing(vec![Attributes::new()]))
                }
            })
        }
    }

    #[tokio::test]
    async fn observer_failure_names_the_resource() {
        let observer = FailingObserver {
            fail_on: "s3.bucket.logs",
            calls: Default::default(),
        };

        let err = DriftDetector::default()
            .detect(&bucket(json!({})), &observer)
            .await
            .unwrap_err();
        match &err {
            DriftError::Observe { resource, source } => {
                assert_eq!(resource, "s3.bucket.logs");
                assert_eq!(source.message, "connection refused");
            }
        }
        assert!(err.to_string().contains("s3.bucket.logs"));
    }

    #[tokio::test]
    async fn detect_all_stops_at_first_observer_failure() {
        let resources = vec![
            Resource::new("s3", "bucket", "assets"),
            bucket(json!({})),
            Resource::new("s3", "bucket", "archive"),
        ];
        let observer = FailingObserver {
            fail_on: "s3.bucket.logs",
            calls: Default::default(),
        };

        let err = DriftDetector::default()
            .detect_all(&resources, &observer)
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::Observe { ref resource, .. } if resource == "s3.bucket.logs"));
        assert_eq!(observer.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
