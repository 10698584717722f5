//! State document format migrations
//!
//! Migrations are registered as single-version steps and chained to reach a
//! target version. They run on an in-memory copy; the caller decides whether
//! to store the result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kolumn_core::resource::{Dependency, DependencyKind};
use serde::Serialize;

use crate::backend::{BackendError, BackendResult};
use crate::state::StateDocument;

/// Transformation applied by one migration step
pub type MigrationFn = fn(&mut StateDocument) -> Result<(), String>;

/// Upgrade from `from` to `from + 1`
#[derive(Clone)]
pub struct MigrationStep {
    pub from: u32,
    pub description: &'static str,
    pub apply: MigrationFn,
}

impl MigrationStep {
    pub fn to(&self) -> u32 {
        self.from + 1
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from", &self.from)
            .field("to", &self.to())
            .field("description", &self.description)
            .finish()
    }
}

/// Ordered set of migration steps
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationStep>,
}

impl MigrationRegistry {
    /// A registry with no steps
    pub fn empty() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    /// Register a step, replacing any existing step from the same version
    pub fn register(&mut self, step: MigrationStep) {
        self.steps.insert(step.from, step);
    }

    pub fn with_step(mut self, step: MigrationStep) -> Self {
        self.register(step);
        self
    }

    /// Highest version reachable from version 1
    pub fn latest_version(&self) -> u32 {
        let mut version = 1;
        while self.steps.contains_key(&version) {
            version += 1;
        }
        version
    }

    /// Steps leading from `from` to `to`, in order
    pub fn plan(&self, name: &str, from: u32, to: u32) -> BackendResult<Vec<&MigrationStep>> {
        if to < from {
            return Err(BackendError::Migration {
                name: name.to_string(),
                from,
                to,
                reason: "downgrades are not supported".to_string(),
            });
        }

        (from..to)
            .map(|version| {
                self.steps.get(&version).ok_or_else(|| BackendError::Migration {
                    name: name.to_string(),
                    from,
                    to,
                    reason: format!("no migration registered from v{}", version),
                })
            })
            .collect()
    }

    /// Upgrade `state` in place to version `to`
    pub fn apply(&self, name: &str, state: &mut StateDocument, to: u32) -> BackendResult<()> {
        let from = state.version;
        for step in self.plan(name, from, to)? {
            log::info!(
                "Migrating state {} from v{} to v{}: {}",
                name,
                step.from,
                step.to(),
                step.description
            );
            (step.apply)(state).map_err(|reason| BackendError::Migration {
                name: name.to_string(),
                from: step.from,
                to: step.to(),
                reason,
            })?;
            state.version = step.to();
        }
        Ok(())
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::empty().with_step(MigrationStep {
            from: 1,
            description: "move resource depends_on lists into dependency records",
            apply: lift_depends_on,
        })
    }
}

/// v1 kept dependencies only on the resources themselves
fn lift_depends_on(state: &mut StateDocument) -> Result<(), String> {
    let mut lifted = Vec::new();
    for resource in &mut state.resources {
        let id = resource.id();
        for target in resource.depends_on.drain(..) {
            lifted.push(Dependency::new(&id, target).with_kind(DependencyKind::Explicit));
        }
    }
    for dependency in lifted {
        state.add_dependency(dependency);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationStatus {
    Succeeded,
    Failed { reason: String },
}

/// One entry of the migration log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub state_name: String,
    pub from_version: u32,
    pub to_version: u32,
    /// Name of the backup taken before migrating
    pub backup: Option<String>,
    #[serde(flatten)]
    pub status: MigrationStatus,
    pub at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn is_success(&self) -> bool {
        self.status == MigrationStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolumn_core::resource::Resource;

    fn v1_state() -> StateDocument {
        let mut state = StateDocument::new();
        state.version = 1;
        state.upsert_resource(Resource::new("pg", "table", "users"));
        state.upsert_resource(
            Resource::new("pg", "table", "orders").with_depends_on("pg.table.users"),
        );
        state
    }

    #[test]
    fn test_default_registry_reaches_current_version() {
        assert_eq!(
            MigrationRegistry::default().latest_version(),
            StateDocument::CURRENT_VERSION
        );
    }

    #[test]
    fn test_v1_to_v2_lifts_depends_on() {
        let mut state = v1_state();
        MigrationRegistry::default()
            .apply("prod", &mut state, 2)
            .unwrap();

        assert_eq!(state.version, 2);
        assert!(state.resources.iter().all(|r| r.depends_on.is_empty()));
        assert_eq!(
            state.dependencies,
            vec![Dependency::new("pg.table.orders", "pg.table.users")]
        );
        assert!(state
            .dependency_graph()
            .depends_on_transitively("pg.table.orders", "pg.table.users"));
    }

    #[test]
    fn test_plan_rejects_gaps_and_downgrades() {
        let registry = MigrationRegistry::default();
        assert!(registry.plan("prod", 2, 2).unwrap().is_empty());

        match registry.plan("prod", 1, 3) {
            Err(BackendError::Migration { reason, .. }) => {
                assert!(reason.contains("from v2"));
            }
            other => panic!("Expected Migration error, got {:?}", other),
        }
        assert!(registry.plan("prod", 2, 1).is_err());
    }

    #[test]
    fn test_failing_step_reports_its_versions() {
        let registry = MigrationRegistry::default().with_step(MigrationStep {
            from: 2,
            description: "always fails",
            apply: |_| Err("unsupported provider layout".to_string()),
        });

        let mut state = v1_state();
        match registry.apply("prod", &mut state, 3) {
            Err(BackendError::Migration { from, to, reason, .. }) => {
                assert_eq!((from, to), (2, 3));
                assert_eq!(reason, "unsupported provider layout");
            }
            other => panic!("Expected Migration error, got {:?}", other),
        }
    }
}
