//! Impact analysis - Which resources are affected when one resource changes

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{DependencyGraph, GraphError, GraphResult};

/// Kind of change being applied to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Replace,
    Delete,
    Destroy,
}

impl ChangeKind {
    /// Changes that remove the resource (at least temporarily)
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ChangeKind::Replace | ChangeKind::Delete | ChangeKind::Destroy
        )
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "replace" => Ok(ChangeKind::Replace),
            "delete" => Ok(ChangeKind::Delete),
            "destroy" => Ok(ChangeKind::Destroy),
            other => Err(format!("Unknown change kind: {}", other)),
        }
    }
}

/// Distance class of an impacted resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactKind {
    /// Requires the changed resource directly
    Direct,
    /// Two hops away
    Indirect,
    /// Further away
    Cascading,
}

impl ImpactKind {
    fn from_distance(distance: usize) -> Self {
        match distance {
            0 | 1 => ImpactKind::Direct,
            2 => ImpactKind::Indirect,
            _ => ImpactKind::Cascading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One resource affected by a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Impact {
    pub resource: String,
    pub distance: usize,
    pub kind: ImpactKind,
    pub severity: ImpactSeverity,
    /// The resource through which this one is reached
    pub via: String,
}

/// All resources affected by a change, nearest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactReport {
    pub resource: String,
    pub change: ChangeKind,
    pub impacts: Vec<Impact>,
}

impl ImpactReport {
    pub fn is_empty(&self) -> bool {
        self.impacts.is_empty()
    }

    pub fn max_severity(&self) -> Option<ImpactSeverity> {
        self.impacts.iter().map(|i| i.severity).max()
    }

    pub fn count(&self, kind: ImpactKind) -> usize {
        self.impacts.iter().filter(|i| i.kind == kind).count()
    }
}

impl DependencyGraph {
    /// Walk the reverse edges from `id` and classify every resource that
    /// (transitively) requires it.
    pub fn impact_analysis(&self, id: &str, change: ChangeKind) -> GraphResult<ImpactReport> {
        if !self.contains(id) {
            return Err(GraphError::UnknownResource(id.to_string()));
        }

        let mut distances: HashMap<&str, (usize, &str)> = HashMap::new();
        let mut queue = VecDeque::from([(id, 0usize)]);

        while let Some((current, distance)) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if dependent == id || distances.contains_key(dependent) {
                    continue;
                }
                distances.insert(dependent, (distance + 1, current));
                queue.push_back((dependent, distance + 1));
            }
        }

        let mut impacts: Vec<Impact> = distances
            .into_iter()
            .map(|(resource, (distance, via))| {
                let kind = ImpactKind::from_distance(distance);
                Impact {
                    resource: resource.to_string(),
                    distance,
                    kind,
                    severity: severity_for(kind, change),
                    via: via.to_string(),
                }
            })
            .collect();
        impacts.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.resource.cmp(&b.resource))
        });

        log::debug!(
            "Impact of {:?} on {}: {} resources affected",
            change,
            id,
            impacts.len()
        );

        Ok(ImpactReport {
            resource: id.to_string(),
            change,
            impacts,
        })
    }
}

fn severity_for(kind: ImpactKind, change: ChangeKind) -> ImpactSeverity {
    match kind {
        ImpactKind::Direct if change.is_destructive() => ImpactSeverity::Critical,
        ImpactKind::Direct => ImpactSeverity::High,
        ImpactKind::Indirect => ImpactSeverity::Medium,
        ImpactKind::Cascading => ImpactSeverity::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{id, res};

    /// a <- b <- c <- d, and e <- b
    fn chain() -> DependencyGraph {
        let resources = vec![
            res("a", &[]),
            res("b", &["pg.table.a"]),
            res("c", &["pg.table.b"]),
            res("d", &["pg.table.c"]),
            res("e", &["pg.table.b"]),
            res("unrelated", &[]),
        ];
        DependencyGraph::build(&resources, &[])
    }

    #[test]
    fn impacts_are_classified_by_distance() {
        let report = chain().impact_analysis(&id("a"), ChangeKind::Update).unwrap();

        let summary: Vec<(String, usize, ImpactKind)> = report
            .impacts
            .iter()
            .map(|i| (i.resource.clone(), i.distance, i.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                (id("b"), 1, ImpactKind::Direct),
                (id("c"), 2, ImpactKind::Indirect),
                (id("e"), 2, ImpactKind::Indirect),
                (id("d"), 3, ImpactKind::Cascading),
            ]
        );
        assert_eq!(report.impacts[0].severity, ImpactSeverity::High);
        assert_eq!(report.impacts[3].severity, ImpactSeverity::Low);
        assert_eq!(report.impacts[1].via, id("b"));
        assert_eq!(report.count(ImpactKind::Indirect), 2);
    }

    #[test]
    fn destructive_change_escalates_direct_impacts() {
        let report = chain().impact_analysis(&id("a"), ChangeKind::Delete).unwrap();
        assert_eq!(report.impacts[0].severity, ImpactSeverity::Critical);
        assert_eq!(report.impacts[1].severity, ImpactSeverity::Medium);
        assert_eq!(report.max_severity(), Some(ImpactSeverity::Critical));
    }

    #[test]
    fn leaf_change_has_no_impact() {
        let report = chain().impact_analysis(&id("d"), ChangeKind::Destroy).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.max_severity(), None);
    }

    #[test]
    fn unknown_resource_is_an_error() {
        assert_eq!(
            chain().impact_analysis("pg.table.ghost", ChangeKind::Update),
            Err(GraphError::UnknownResource("pg.table.ghost".to_string()))
        );
    }

    #[test]
    fn change_kind_parses_case_insensitively() {
        assert_eq!("DELETE".parse::<ChangeKind>(), Ok(ChangeKind::Delete));
        assert!("explode".parse::<ChangeKind>().is_err());
    }
}
