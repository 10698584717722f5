//! Provider - Capabilities supplied by infrastructure providers
//!
//! The core never talks to real infrastructure itself. Observing a resource's
//! live attributes is an injected capability: each provider implements
//! [`ResourceObserver`] and the drift detector consumes it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::resource::{Attributes, Resource};

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub resource_id: Option<String>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    pub fn for_resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Live attributes of a resource as reported by its provider
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Observation {
    /// Whether the resource still exists
    pub exists: bool,
    /// Observed attributes, one map per instance in state order
    pub instances: Vec<Attributes>,
}

impl Observation {
    pub fn not_found() -> Self {
        Self {
            exists: false,
            instances: Vec::new(),
        }
    }

    pub fn existing(instances: Vec<Attributes>) -> Self {
        Self {
            exists: true,
            instances,
        }
    }
}

/// Reads the real-world attributes of a managed resource
pub trait ResourceObserver: Send + Sync {
    /// Name of this observer (usually the provider name)
    fn name(&self) -> &str;

    /// Observe the resource. Returns `Observation::not_found()` if it no
    /// longer exists.
    fn observe<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<Observation>>;
}

/// Observer backed by attributes captured ahead of time
///
/// The snapshot maps resource IDs to either one attribute object or a list
/// of attribute objects (one per instance). Resources absent from the
/// snapshot are reported as not found.
#[derive(Debug, Clone, Default)]
pub struct SnapshotObserver {
    snapshots: HashMap<String, Vec<Attributes>>,
}

impl SnapshotObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, id: impl Into<String>, instances: Vec<Attributes>) -> Self {
        self.snapshots.insert(id.into(), instances);
        self
    }

    /// Parse a JSON snapshot document
    pub fn from_json(value: &Value) -> ProviderResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| ProviderError::new("Snapshot must be a JSON object keyed by resource ID"))?;

        let mut snapshots = HashMap::new();
        for (id, entry) in map {
            let instances = match entry {
                Value::Object(attrs) => vec![attrs.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_object().cloned().ok_or_else(|| {
                            ProviderError::new("Snapshot instances must be objects")
                                .for_resource(id.clone())
                        })
                    })
                    .collect::<ProviderResult<Vec<_>>>()?,
                _ => {
                    return Err(ProviderError::new(
                        "Snapshot entry must be an object or a list of objects",
                    )
                    .for_resource(id.clone()));
                }
            };
            snapshots.insert(id.clone(), instances);
        }

        Ok(Self { snapshots })
    }
}

impl ResourceObserver for SnapshotObserver {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn observe<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<Observation>> {
        Box::pin(async move {
            Ok(match self.snapshots.get(&resource.id()) {
                Some(instances) => Observation::existing(instances.clone()),
                None => Observation::not_found(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_error_display_includes_resource() {
        let err = ProviderError::new("connection refused").for_resource("pg.table.users");
        assert_eq!(err.to_string(), "[pg.table.users] connection refused");
        assert_eq!(ProviderError::new("boom").to_string(), "boom");
    }

    #[tokio::test]
    async fn snapshot_observer_reads_objects_and_lists() {
        let observer = SnapshotObserver::from_json(&json!({
            "pg.table.users": {"owner": "app"},
            "kafka.topic.events": [{"partitions": 3}, {"partitions": 6}],
        }))
        .unwrap();

        let users = Resource::new("pg", "table", "users");
        let observed = observer.observe(&users).await.unwrap();
        assert!(observed.exists);
        assert_eq!(observed.instances[0]["owner"], json!("app"));

        let events = Resource::new("kafka", "topic", "events");
        let observed = observer.observe(&events).await.unwrap();
        assert_eq!(observed.instances.len(), 2);

        let ghost = Resource::new("pg", "table", "ghost");
        assert!(!observer.observe(&ghost).await.unwrap().exists);
    }

    #[test]
    fn snapshot_observer_rejects_scalars() {
        let err = SnapshotObserver::from_json(&json!({"pg.table.users": 3})).unwrap_err();
        assert_eq!(err.resource_id.as_deref(), Some("pg.table.users"));
        assert!(SnapshotObserver::from_json(&json!([1, 2])).is_err());
    }
}
