//! Drift resolution
//!
//! Auto-resolvable items are written back to state first, then any explicit
//! actions run in the order given. Every action is an external call through
//! a [`DriftResolver`].

use serde::Serialize;
use serde_json::Value;

use super::{DriftAnalysis, DriftDetector};
use crate::provider::{BoxFuture, ProviderResult};

/// Address of one attribute on one resource instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldTarget {
    pub resource_id: String,
    pub instance: usize,
    pub field: String,
}

impl FieldTarget {
    pub fn new(resource_id: impl Into<String>, instance: usize, field: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            instance,
            field: field.into(),
        }
    }
}

impl std::fmt::Display for FieldTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}].{}", self.resource_id, self.instance, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Record `value` in state (accept the real-world value)
    UpdateStateField { target: FieldTarget, value: Value },
    /// Push `value` to the real resource (restore the recorded value)
    UpdateResourceField { target: FieldTarget, value: Value },
}

impl ResolutionAction {
    pub fn target(&self) -> &FieldTarget {
        match self {
            ResolutionAction::UpdateStateField { target, .. }
            | ResolutionAction::UpdateResourceField { target, .. } => target,
        }
    }
}

/// Side-effecting calls used to resolve drift
pub trait DriftResolver: Send + Sync {
    fn update_state_field<'a>(
        &'a self,
        target: &'a FieldTarget,
        value: &'a Value,
    ) -> BoxFuture<'a, ProviderResult<()>>;

    fn update_resource_field<'a>(
        &'a self,
        target: &'a FieldTarget,
        value: &'a Value,
    ) -> BoxFuture<'a, ProviderResult<()>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAction {
    pub action: ResolutionAction,
    pub error: String,
}

/// Outcome of a resolution run
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ResolutionReport {
    pub applied: Vec<ResolutionAction>,
    pub failed: Vec<FailedAction>,
}

impl ResolutionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl DriftDetector {
    /// Apply every auto-resolvable item, then the explicit actions.
    ///
    /// A failing action is recorded and does not stop the remaining ones.
    pub async fn resolve(
        &self,
        analysis: &DriftAnalysis,
        actions: Vec<ResolutionAction>,
        resolver: &dyn DriftResolver,
    ) -> ResolutionReport {
        let automatic = analysis
            .auto_resolvable_items()
            .map(|item| ResolutionAction::UpdateStateField {
                target: FieldTarget::new(&item.resource_id, item.instance, &item.field),
                value: item.observed.clone(),
            });

        let mut report = ResolutionReport::default();
        for action in automatic.chain(actions) {
            let result = match &action {
                ResolutionAction::UpdateStateField { target, value } => {
                    resolver.update_state_field(target, value).await
                }
                ResolutionAction::UpdateResourceField { target, value } => {
                    resolver.update_resource_field(target, value).await
                }
            };

            match result {
                Ok(()) => report.applied.push(action),
                Err(err) => {
                    log::warn!("Failed to resolve drift on {}: {}", action.target(), err);
                    report.failed.push(FailedAction {
                        action,
                        error: err.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Resolved drift on {}: {} applied, {} failed",
            analysis.resource_id,
            report.applied.len(),
            report.failed.len()
        );
        report
    }
}
