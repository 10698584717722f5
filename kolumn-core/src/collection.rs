//! Collection - Named, health-tracked groups of resources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::Resource;

/// Overall state derived from member health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    /// No members
    #[default]
    Empty,
    /// Every member healthy
    Active,
    /// More than half the members errored
    Degraded,
    /// Anything in between
    Partial,
}

impl std::fmt::Display for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectionState::Empty => "empty",
            CollectionState::Active => "active",
            CollectionState::Degraded => "degraded",
            CollectionState::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Aggregated health of a collection's members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CollectionHealth {
    pub total: usize,
    pub healthy: usize,
    pub errors: usize,
    pub state: CollectionState,
}

impl CollectionHealth {
    /// Aggregate member health. `None` stands for a member that no longer
    /// exists and counts as an error.
    pub fn compute<'a>(members: impl IntoIterator<Item = Option<&'a Resource>>) -> Self {
        let mut health = Self::default();
        for member in members {
            health.total += 1;
            match member {
                Some(resource) if resource.has_errors() => health.errors += 1,
                Some(resource) if resource.is_healthy() => health.healthy += 1,
                Some(_) => {}
                None => health.errors += 1,
            }
        }

        health.state = if health.total == 0 {
            CollectionState::Empty
        } else if health.errors == 0 && health.healthy == health.total {
            CollectionState::Active
        } else if health.errors * 2 > health.total {
            CollectionState::Degraded
        } else {
            CollectionState::Partial
        };
        health
    }
}

/// A named group of resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Member resource IDs
    #[serde(default)]
    pub resources: Vec<String>,
    /// Names of collections this one depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub health: CollectionHealth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            resources: Vec::new(),
            depends_on: Vec::new(),
            health: CollectionHealth::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.resources.iter().any(|r| r == resource_id)
    }

    /// Add a member; returns false if it was already present
    pub fn add_resource(&mut self, resource_id: impl Into<String>) -> bool {
        let resource_id = resource_id.into();
        if self.contains(&resource_id) {
            return false;
        }
        self.resources.push(resource_id);
        self.updated_at = Utc::now();
        true
    }

    /// Remove a member; returns false if it was not present
    pub fn remove_resource(&mut self, resource_id: &str) -> bool {
        let before = self.resources.len();
        self.resources.retain(|r| r != resource_id);
        let removed = self.resources.len() != before;
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Recompute health by looking every member up through `lookup`
    pub fn refresh_health<'a, F>(&mut self, lookup: F) -> CollectionHealth
    where
        F: Fn(&str) -> Option<&'a Resource>,
    {
        self.health =
            CollectionHealth::compute(self.resources.iter().map(|id| lookup(id.as_str())));
        self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Instance, InstanceStatus};

    fn member(name: &str, status: InstanceStatus) -> Resource {
        Resource::new("pg", "table", name).with_instance(Instance::new(status))
    }

    #[test]
    fn empty_collection_is_empty() {
        let health = CollectionHealth::compute(Vec::<Option<&Resource>>::new());
        assert_eq!(health.state, CollectionState::Empty);
        assert_eq!(health.total, 0);
    }

    #[test]
    fn all_healthy_is_active() {
        let a = member("a", InstanceStatus::Ready);
        let b = member("b", InstanceStatus::Ready);
        let health = CollectionHealth::compute([Some(&a), Some(&b)]);
        assert_eq!(health.state, CollectionState::Active);
        assert_eq!(health.healthy, 2);
    }

    #[test]
    fn more_than_half_errored_is_degraded() {
        let a = member("a", InstanceStatus::Error);
        let b = member("b", InstanceStatus::Tainted);
        let c = member("c", InstanceStatus::Ready);
        let health = CollectionHealth::compute([Some(&a), Some(&b), Some(&c)]);
        assert_eq!(health.errors, 2);
        assert_eq!(health.state, CollectionState::Degraded);
    }

    #[test]
    fn half_errored_is_partial() {
        let a = member("a", InstanceStatus::Error);
        let b = member("b", InstanceStatus::Ready);
        let health = CollectionHealth::compute([Some(&a), Some(&b)]);
        assert_eq!(health.state, CollectionState::Partial);
    }

    #[test]
    fn pending_members_make_collection_partial() {
        let a = member("a", InstanceStatus::Ready);
        let b = member("b", InstanceStatus::Creating);
        let health = CollectionHealth::compute([Some(&a), Some(&b)]);
        assert_eq!(health.errors, 0);
        assert_eq!(health.state, CollectionState::Partial);
    }

    #[test]
    fn missing_members_count_as_errors() {
        let health = CollectionHealth::compute([None, None]);
        assert_eq!(health.errors, 2);
        assert_eq!(health.state, CollectionState::Degraded);
    }

    #[test]
    fn membership_is_deduplicated() {
        let mut collection = Collection::new("analytics");
        assert!(collection.add_resource("pg.table.a"));
        assert!(!collection.add_resource("pg.table.a"));
        assert!(collection.remove_resource("pg.table.a"));
        assert!(!collection.remove_resource("pg.table.a"));
    }

    #[test]
    fn refresh_health_uses_lookup() {
        let ready = member("a", InstanceStatus::Ready);
        let mut collection = Collection::new("analytics");
        collection.add_resource(ready.id());
        collection.add_resource("pg.table.gone");

        let health = collection.refresh_health(|id| (id == ready.id()).then_some(&ready));
        assert_eq!(health.total, 2);
        assert_eq!(health.healthy, 1);
        assert_eq!(health.errors, 1);
        assert_eq!(collection.health.state, CollectionState::Partial);
    }
}
