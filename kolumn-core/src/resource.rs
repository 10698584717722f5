//! Resource - Representing managed resources, their instances and dependencies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute map of a resource instance
pub type Attributes = Map<String, Value>;

/// Unique identifier for a resource (`provider.type.name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Provider name (e.g., "postgres", "kafka")
    pub provider: String,
    /// Resource type (e.g., "table", "topic")
    pub resource_type: String,
    /// Resource name
    pub name: String,
}

impl ResourceId {
    pub fn new(
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parse a dotted ID. The name is everything after the second dot, so
    /// names containing dots survive a round trip.
    pub fn parse(id: &str) -> Option<Self> {
        let mut parts = id.splitn(3, '.');
        let provider = parts.next().filter(|s| !s.is_empty())?;
        let resource_type = parts.next().filter(|s| !s.is_empty())?;
        let name = parts.next().filter(|s| !s.is_empty())?;
        Some(Self::new(provider, resource_type, name))
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.provider, self.resource_type, self.name)
    }
}

/// Lifecycle status of a resource instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Pending,
    Creating,
    Ready,
    Updating,
    Deleting,
    Error,
    Tainted,
}

impl InstanceStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, InstanceStatus::Ready)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, InstanceStatus::Error | InstanceStatus::Tainted)
    }
}

/// One concrete instance of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Instance {
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub attributes: Attributes,
    /// Attribute names whose values must not be displayed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitive_attributes: Vec<String>,
}

impl Instance {
    pub fn new(status: InstanceStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_sensitive(mut self, key: impl Into<String>) -> Self {
        self.sensitive_attributes.push(key.into());
        self
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive_attributes.iter().any(|s| s == key)
    }
}

/// Kind of relationship between two resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Declared by the user (`depends_on`)
    #[default]
    Explicit,
    /// Inferred from an attribute reference
    Reference,
    /// Inferred by a provider (e.g., a table inside a schema)
    Implicit,
    /// Read-only data lookup
    Data,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DependencyKind::Explicit => "explicit",
            DependencyKind::Reference => "reference",
            DependencyKind::Implicit => "implicit",
            DependencyKind::Data => "data",
        };
        f.write_str(s)
    }
}

/// Typed reference to another resource's attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReference {
    /// Referenced resource ID
    pub target: String,
    /// Referenced attribute (e.g., "id", "arn")
    pub attribute: String,
    #[serde(default = "reference_kind")]
    pub kind: DependencyKind,
}

fn reference_kind() -> DependencyKind {
    DependencyKind::Reference
}

impl ResourceReference {
    pub fn new(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
            kind: DependencyKind::Reference,
        }
    }
}

/// A managed resource as recorded in state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub provider: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<Instance>,
    /// IDs of resources this one requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Attributes,
}

impl Resource {
    pub fn new(
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
            instances: Vec::new(),
            depends_on: Vec::new(),
            references: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Dotted resource ID (`provider.type.name`)
    pub fn id(&self) -> String {
        format!("{}.{}.{}", self.provider, self.resource_type, self.name)
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(&self.provider, &self.resource_type, &self.name)
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instances.push(instance);
        self
    }

    pub fn with_depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_reference(mut self, reference: ResourceReference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// A resource is healthy when it has instances and all of them are ready
    pub fn is_healthy(&self) -> bool {
        !self.instances.is_empty() && self.instances.iter().all(|i| i.status.is_healthy())
    }

    pub fn has_errors(&self) -> bool {
        self.instances.iter().any(|i| i.status.is_error())
    }

    /// Returns the name of the first empty identity field, if any
    pub fn missing_identity_field(&self) -> Option<&'static str> {
        if self.provider.trim().is_empty() {
            Some("provider")
        } else if self.resource_type.trim().is_empty() {
            Some("type")
        } else if self.name.trim().is_empty() {
            Some("name")
        } else {
            None
        }
    }
}

/// Directed edge: `from` requires `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: DependencyKind::Explicit,
            optional: false,
        }
    }

    pub fn with_kind(mut self, kind: DependencyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}
