//! Persistent collections
//!
//! Collections live inside the state document they group resources of.
//! Every mutation reads the state, changes it and writes it back while
//! holding the state's lock.

use kolumn_core::collection::{Collection, CollectionHealth};
use kolumn_core::graph::{DependencyGraph, GraphError, GraphNode};
use kolumn_core::resource::{DependencyKind, Resource};
use thiserror::Error;

use crate::backend::BackendError;
use crate::manager::StateManager;
use crate::state::StateDocument;

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Collection not found: {0}")]
    NotFound(String),

    #[error("Collection already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource {resource} does not exist in state {state}")]
    UnknownResource { state: String, resource: String },

    #[error("Collection {name} is required by: {}", .dependents.join(", "))]
    HasDependents {
        name: String,
        dependents: Vec<String>,
    },

    #[error("Invalid collection: {0}")]
    Invalid(String),

    #[error("Invalid collection dependency: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type CollectionResult<T> = Result<T, CollectionError>;

/// What happens to member resources when a collection is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the member resources and every dependency touching them
    Cascade,
    /// Keep the member resources
    Unassign,
}

/// Collections of one state
pub struct CollectionManager<'a> {
    manager: &'a StateManager,
    state_name: String,
}

impl<'a> CollectionManager<'a> {
    pub fn new(manager: &'a StateManager, state_name: impl Into<String>) -> Self {
        Self {
            manager,
            state_name: state_name.into(),
        }
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    /// Current state, or a fresh document if none is stored yet
    async fn load(&self) -> CollectionResult<StateDocument> {
        match self.manager.get(&self.state_name).await {
            Ok(state) => Ok(state),
            Err(BackendError::NotFound(_)) => Ok(StateDocument::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mutate<T, F>(&self, operation: &str, f: F) -> CollectionResult<T>
    where
        F: FnOnce(&mut StateDocument) -> CollectionResult<T>,
    {
        self.manager
            .with_lock(&self.state_name, operation, || async move {
                let mut state = self.load().await?;
                let value = f(&mut state)?;
                self.manager.put(&self.state_name, state).await?;
                Ok(value)
            })
            .await
    }

    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> CollectionResult<Collection> {
        if name.trim().is_empty() {
            return Err(CollectionError::Invalid(
                "collection name must not be empty".to_string(),
            ));
        }

        let collection = self
            .mutate("collection create", |state| {
                if state.find_collection(name).is_some() {
                    return Err(CollectionError::AlreadyExists(name.to_string()));
                }
                let mut collection = Collection::new(name);
                if let Some(description) = description {
                    collection = collection.with_description(description);
                }
                state.collections.push(collection.clone());
                Ok(collection)
            })
            .await?;

        log::info!("Created collection {} in {}", name, self.state_name);
        Ok(collection)
    }

    pub async fn get(&self, name: &str) -> CollectionResult<Collection> {
        self.load()
            .await?
            .find_collection(name)
            .cloned()
            .ok_or_else(|| CollectionError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> CollectionResult<Vec<Collection>> {
        Ok(self.load().await?.collections)
    }

    /// Add an existing resource to a collection
    pub async fn add_resource(
        &self,
        collection: &str,
        resource_id: &str,
    ) -> CollectionResult<Collection> {
        let state_name = self.state_name.clone();
        self.mutate("collection add", |state| {
            if state.find_resource(resource_id).is_none() {
                return Err(CollectionError::UnknownResource {
                    state: state_name,
                    resource: resource_id.to_string(),
                });
            }
            let StateDocument {
                resources,
                collections,
                ..
            } = state;
            let target = find_mut(collections, collection)?;
            target.add_resource(resource_id);
            refresh(target, resources);
            Ok(target.clone())
        })
        .await
    }

    pub async fn remove_resource(
        &self,
        collection: &str,
        resource_id: &str,
    ) -> CollectionResult<Collection> {
        self.mutate("collection remove", |state| {
            let StateDocument {
                resources,
                collections,
                ..
            } = state;
            let target = find_mut(collections, collection)?;
            if !target.remove_resource(resource_id) {
                log::debug!("{} is not a member of {}", resource_id, collection);
            }
            refresh(target, resources);
            Ok(target.clone())
        })
        .await
    }

    /// Record that `collection` depends on `depends_on`
    pub async fn add_dependency(
        &self,
        collection: &str,
        depends_on: &str,
    ) -> CollectionResult<Collection> {
        self.mutate("collection depend", |state| {
            if state.find_collection(depends_on).is_none() {
                return Err(CollectionError::NotFound(depends_on.to_string()));
            }
            if state.find_collection(collection).is_none() {
                return Err(CollectionError::NotFound(collection.to_string()));
            }
            collection_graph(&state.collections).check_new_dependency(collection, depends_on)?;

            let target = find_mut(&mut state.collections, collection)?;
            if !target.depends_on.iter().any(|d| d == depends_on) {
                target.depends_on.push(depends_on.to_string());
                target.updated_at = chrono::Utc::now();
            }
            Ok(target.clone())
        })
        .await
    }

    /// Recompute and store the health of one collection
    pub async fn refresh_health(&self, name: &str) -> CollectionResult<CollectionHealth> {
        self.mutate("collection health", |state| {
            let StateDocument {
                resources,
                collections,
                ..
            } = state;
            let target = find_mut(collections, name)?;
            Ok(refresh(target, resources))
        })
        .await
    }

    /// Recompute and store the health of every collection
    pub async fn refresh_all(&self) -> CollectionResult<Vec<Collection>> {
        self.mutate("collection health", |state| {
            let StateDocument {
                resources,
                collections,
                ..
            } = state;
            for collection in collections.iter_mut() {
                refresh(collection, resources);
            }
            Ok(collections.clone())
        })
        .await
    }

    /// Delete a collection. Returns the IDs of resources removed with it
    /// (always empty for [`DeleteMode::Unassign`]).
    pub async fn delete(&self, name: &str, mode: DeleteMode) -> CollectionResult<Vec<String>> {
        let removed = self
            .mutate("collection delete", |state| {
                let position = state
                    .collections
                    .iter()
                    .position(|c| c.name == name)
                    .ok_or_else(|| CollectionError::NotFound(name.to_string()))?;

                let dependents: Vec<String> = state
                    .collections
                    .iter()
                    .filter(|c| c.depends_on.iter().any(|d| d == name))
                    .map(|c| c.name.clone())
                    .collect();
                if !dependents.is_empty() {
                    return Err(CollectionError::HasDependents {
                        name: name.to_string(),
                        dependents,
                    });
                }

                let deleted = state.collections.remove(position);
                if mode == DeleteMode::Unassign {
                    return Ok(Vec::new());
                }

                let mut removed = Vec::new();
                for id in &deleted.resources {
                    if state.remove_resource(id).is_some() {
                        removed.push(id.clone());
                    }
                    state.remove_dependencies_touching(id);
                }

                let StateDocument {
                    resources,
                    collections,
                    ..
                } = state;
                for other in collections.iter_mut() {
                    let before = other.resources.len();
                    other.resources.retain(|id| !deleted.contains(id));
                    if other.resources.len() != before {
                        other.updated_at = chrono::Utc::now();
                        refresh(other, resources);
                    }
                }
                Ok(removed)
            })
            .await?;

        log::info!(
            "Deleted collection {} from {} ({:?}, {} resources removed)",
            name,
            self.state_name,
            mode,
            removed.len()
        );
        Ok(removed)
    }
}

fn find_mut<'c>(collections: &'c mut [Collection], name: &str) -> CollectionResult<&'c mut Collection> {
    collections
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| CollectionError::NotFound(name.to_string()))
}

fn refresh(collection: &mut Collection, resources: &[Resource]) -> CollectionHealth {
    collection.refresh_health(|id| resources.iter().find(|r| r.id() == id))
}

/// Collections and their `depends_on` links as a dependency graph
fn collection_graph(collections: &[Collection]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for collection in collections {
        graph.add_node(GraphNode {
            id: collection.name.clone(),
            provider: "kolumn".to_string(),
            resource_type: "collection".to_string(),
            name: collection.name.clone(),
        });
    }
    for collection in collections {
        for target in &collection.depends_on {
            graph.add_edge(&collection.name, target, DependencyKind::Explicit, false);
        }
    }
    graph
}
