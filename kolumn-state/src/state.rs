//! State document structures for persisting infrastructure state

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use kolumn_core::collection::Collection;
use kolumn_core::graph::DependencyGraph;
use kolumn_core::resource::{Dependency, Resource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::backend::{BackendError, BackendResult};

/// Top-level fields covered by checksums
pub const CHECKSUM_FIELDS: &[&str] = &[
    "resources",
    "providers",
    "dependencies",
    "metadata",
    "governance",
];

/// Descriptive metadata about a state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateMetadata {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub environment: String,
    /// Version of Kolumn that last wrote this state
    #[serde(default)]
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Provider configuration recorded alongside the resources it manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderState {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ProviderState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            source: None,
            config: Map::new(),
        }
    }
}

/// The document stored by a backend under a state name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// State document format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderState>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub metadata: StateMetadata,
    /// Governance data, carried verbatim
    #[serde(default)]
    pub governance: Map<String, Value>,
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateDocument {
    /// Current state document format version
    pub const CURRENT_VERSION: u32 = 2;

    /// Create a new empty state document
    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    /// Create a new state document with a specific lineage
    pub fn with_lineage(lineage: impl Into<String>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage: lineage.into(),
            resources: Vec::new(),
            providers: BTreeMap::new(),
            dependencies: Vec::new(),
            metadata: StateMetadata {
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            governance: Map::new(),
            checksums: BTreeMap::new(),
            collections: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Find a resource by its dotted ID
    pub fn find_resource(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id() == id)
    }

    /// Find a resource mutably by its dotted ID
    pub fn find_resource_mut(&mut self, id: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.id() == id)
    }

    /// Add or replace a resource, keeping its position if it already exists
    pub fn upsert_resource(&mut self, resource: Resource) {
        let id = resource.id();
        if let Some(existing) = self.find_resource_mut(&id) {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    /// Remove a resource from the state
    pub fn remove_resource(&mut self, id: &str) -> Option<Resource> {
        let pos = self.resources.iter().position(|r| r.id() == id)?;
        Some(self.resources.remove(pos))
    }

    /// Record a dependency; returns false if an identical one exists
    pub fn add_dependency(&mut self, dependency: Dependency) -> bool {
        if self
            .dependencies
            .iter()
            .any(|d| d.from == dependency.from && d.to == dependency.to)
        {
            return false;
        }
        self.dependencies.push(dependency);
        true
    }

    /// Drop every dependency edge that starts or ends at `id`, including
    /// `depends_on` entries and references held by other resources.
    /// Returns the number of edges removed.
    pub fn remove_dependencies_touching(&mut self, id: &str) -> usize {
        let before = self.dependencies.len();
        self.dependencies.retain(|d| d.from != id && d.to != id);
        let mut removed = before - self.dependencies.len();

        for resource in &mut self.resources {
            let before = resource.depends_on.len() + resource.references.len();
            resource.depends_on.retain(|target| target != id);
            resource.references.retain(|r| r.target != id);
            removed += before - resource.depends_on.len() - resource.references.len();
        }
        removed
    }

    /// Build the dependency graph for this state
    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::build(&self.resources, &self.dependencies)
    }

    pub fn find_collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn find_collection_mut(&mut self, name: &str) -> Option<&mut Collection> {
        self.collections.iter_mut().find(|c| c.name == name)
    }

    /// Check structural invariants
    pub fn validate(&self) -> BackendResult<()> {
        if self.lineage.trim().is_empty() {
            return Err(BackendError::validation("lineage must not be empty"));
        }
        if self.version == 0 {
            return Err(BackendError::validation("version must be at least 1"));
        }

        let mut seen = HashSet::new();
        for (index, resource) in self.resources.iter().enumerate() {
            if let Some(field) = resource.missing_identity_field() {
                return Err(BackendError::validation(format!(
                    "resource #{} has an empty {}",
                    index, field
                )));
            }
            let id = resource.id();
            if !seen.insert(id.clone()) {
                return Err(BackendError::validation(format!(
                    "duplicate resource ID: {}",
                    id
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 digest of each checksummed top-level field
    pub fn compute_checksums(&self) -> BackendResult<BTreeMap<String, String>> {
        let fields: [(&str, Value); 5] = [
            ("resources", to_value(&self.resources)?),
            ("providers", to_value(&self.providers)?),
            ("dependencies", to_value(&self.dependencies)?),
            ("metadata", to_value(&self.metadata)?),
            ("governance", Value::Object(self.governance.clone())),
        ];

        let mut checksums = BTreeMap::new();
        for (field, value) in fields {
            let bytes = serde_json::to_vec(&value)
                .map_err(|e| BackendError::Serialization(e.to_string()))?;
            checksums.insert(field.to_string(), hex::encode(Sha256::digest(&bytes)));
        }
        Ok(checksums)
    }

    /// Replace the stored checksums with freshly computed ones
    pub fn refresh_checksums(&mut self) -> BackendResult<()> {
        self.checksums = self.compute_checksums()?;
        Ok(())
    }

    /// Fields whose stored checksum does not match the content.
    /// Fields without a stored checksum are not reported.
    pub fn verify_checksums(&self) -> BackendResult<Vec<String>> {
        let computed = self.compute_checksums()?;
        Ok(computed
            .into_iter()
            .filter(|(field, digest)| {
                self.checksums
                    .get(field)
                    .is_some_and(|stored| stored != digest)
            })
            .map(|(field, _)| field)
            .collect())
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn to_value<T: Serialize>(value: &T) -> BackendResult<Value> {
    serde_json::to_value(value).map_err(|e| BackendError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolumn_core::resource::{Instance, InstanceStatus};
    use serde_json::json;

    fn table(name: &str) -> Resource {
        Resource::new("pg", "table", name).with_instance(
            Instance::new(InstanceStatus::Ready).with_attribute("owner", json!("app")),
        )
    }

    #[test]
    fn test_state_document_new() {
        let state = StateDocument::new();
        assert_eq!(state.version, StateDocument::CURRENT_VERSION);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());
        assert_eq!(state.metadata.tool_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_upsert_resource_replaces_in_place() {
        let mut state = StateDocument::new();
        state.upsert_resource(table("users"));
        state.upsert_resource(table("orders"));

        let mut updated = table("users");
        updated.instances[0]
            .attributes
            .insert("owner".to_string(), json!("admin"));
        state.upsert_resource(updated);

        assert_eq!(state.resources.len(), 2);
        assert_eq!(state.resources[0].name, "users");
        assert_eq!(
            state.find_resource("pg.table.users").unwrap().instances[0].attributes["owner"],
            json!("admin")
        );
    }

    #[test]
    fn test_remove_resource() {
        let mut state = StateDocument::new();
        state.upsert_resource(table("users"));

        assert!(state.remove_resource("pg.table.users").is_some());
        assert!(state.resources.is_empty());
        assert!(state.remove_resource("pg.table.users").is_none());
    }

    #[test]
    fn test_add_dependency_is_deduplicated() {
        let mut state = StateDocument::new();
        assert!(state.add_dependency(Dependency::new("pg.table.orders", "pg.table.users")));
        assert!(!state.add_dependency(Dependency::new("pg.table.orders", "pg.table.users")));
        assert_eq!(state.dependencies.len(), 1);
    }

    #[test]
    fn test_remove_dependencies_touching() {
        let mut state = StateDocument::new();
        state.upsert_resource(table("users"));
        state.upsert_resource(table("orders").with_depends_on("pg.table.users"));
        state.upsert_resource(table("audit"));
        state.add_dependency(Dependency::new("pg.table.audit", "pg.table.users"));
        state.add_dependency(Dependency::new("pg.table.audit", "pg.table.orders"));

        let removed = state.remove_dependencies_touching("pg.table.users");
        assert_eq!(removed, 2);
        assert_eq!(state.dependencies.len(), 1);
        assert!(state.find_resource("pg.table.orders").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_dependency_graph_uses_records_and_depends_on() {
        let mut state = StateDocument::new();
        state.upsert_resource(table("users"));
        state.upsert_resource(table("orders").with_depends_on("pg.table.users"));
        state.upsert_resource(table("audit"));
        state.add_dependency(Dependency::new("pg.table.audit", "pg.table.orders"));

        let graph = state.dependency_graph();
        assert_eq!(graph.node_count(), 3);
        assert!(graph.depends_on_transitively("pg.table.audit", "pg.table.users"));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty_identity() {
        let mut state = StateDocument::new();
        state.resources.push(table("users"));
        assert!(state.validate().is_ok());

        state.resources.push(table("users"));
        let err = state.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate resource ID: pg.table.users"));

        let mut state = StateDocument::new();
        state.resources.push(Resource::new("pg", "", "users"));
        assert!(matches!(state.validate(), Err(BackendError::Validation(_))));

        let mut state = StateDocument::new();
        state.lineage = String::new();
        assert!(state.validate().is_err());

        let mut state = StateDocument::new();
        state.version = 0;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_checksums_detect_tampering() {
        let mut state = StateDocument::new();
        state.upsert_resource(table("users"));
        state.refresh_checksums().unwrap();
        assert_eq!(state.checksums.len(), CHECKSUM_FIELDS.len());
        assert!(state.verify_checksums().unwrap().is_empty());

        state.governance.insert("owner".to_string(), json!("data-team"));
        assert_eq!(state.verify_checksums().unwrap(), vec!["governance"]);
    }

    #[test]
    fn test_state_document_serialization() {
        let mut state = StateDocument::new();
        state.upsert_resource(table("users"));
        state
            .providers
            .insert("pg".to_string(), ProviderState::new("pg"));

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("collections").is_none());
        assert_eq!(json["resources"][0]["type"], json!("table"));

        let deserialized: StateDocument = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized, state);
    }

    #[test]
    fn test_minimal_document_deserializes() {
        let state: StateDocument =
            serde_json::from_value(json!({"version": 1, "serial": 3, "lineage": "abc"})).unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.serial, 3);
        assert!(state.resources.is_empty());
        assert!(state.created_at.is_none());
    }
}
