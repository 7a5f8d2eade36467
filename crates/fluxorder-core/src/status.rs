//! Read-only status snapshots.
//!
//! A [`StatusSnapshot`] is a detached copy of every unit's bookkeeping plus
//! the dependency graph it was scheduled against. It is produced by the
//! engine after each batch of transitions and never feeds back into it.

use crate::graph::DependencyGraph;
use crate::unit::{UnitRecord, UnitStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatusView {
    pub name: String,
    pub status: UnitStatus,
    pub last_applied_revision: Option<String>,
    pub last_transition_time: DateTime<Utc>,
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub suspended: bool,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// First dependency, in topological order, that is not `Ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphView {
    pub generation: u64,
    pub order: Vec<String>,
    pub edges: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    Ready,
    Blocked {
        unit: String,
        status: UnitStatus,
        reason: String,
    },
}

impl Health {
    pub fn is_ready(&self) -> bool {
        matches!(self, Health::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Units in topological order.
    pub units: Vec<UnitStatusView>,
    pub graph: GraphView,
    pub health: Health,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::build(&DependencyGraph::empty(), std::iter::empty())
    }
}

impl StatusSnapshot {
    /// Assemble a snapshot from the graph and `(record, suspended)` pairs.
    /// Graph units without a record are left out.
    pub fn build<'a, I>(graph: &DependencyGraph, records: I) -> Self
    where
        I: IntoIterator<Item = (&'a UnitRecord, bool)>,
    {
        let by_name: HashMap<&str, (&UnitRecord, bool)> = records
            .into_iter()
            .map(|(r, suspended)| (r.name.as_str(), (r, suspended)))
            .collect();

        let is_ready = |name: &str| {
            by_name
                .get(name)
                .is_some_and(|(r, suspended)| !suspended && r.status == UnitStatus::Ready)
        };

        let mut units = Vec::with_capacity(graph.len());
        for name in graph.order() {
            let Some((record, suspended)) = by_name.get(name.as_str()) else {
                continue;
            };
            let blocked_by = graph
                .transitive_dependencies(name)
                .into_iter()
                .find(|dep| !is_ready(dep));
            units.push(UnitStatusView {
                name: record.name.clone(),
                status: record.status,
                last_applied_revision: record.last_applied_revision.clone(),
                last_transition_time: record.last_transition_time,
                depends_on: graph.dependencies(name).to_vec(),
                suspended: *suspended,
                failure_count: record.failure_count,
                next_retry_at: record.next_retry_at,
                last_error: record.last_error.clone(),
                blocked_by,
            });
        }

        let health = units
            .iter()
            .find(|u| u.suspended || u.status != UnitStatus::Ready)
            .map(|u| Health::Blocked {
                unit: u.name.clone(),
                status: u.status,
                reason: blocking_reason(u),
            })
            .unwrap_or(Health::Ready);

        Self {
            units,
            graph: GraphView {
                generation: graph.generation(),
                order: graph.order().to_vec(),
                edges: graph.edges().clone(),
            },
            health,
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitStatusView> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn generation(&self) -> u64 {
        self.graph.generation
    }
}

fn blocking_reason(unit: &UnitStatusView) -> String {
    if unit.suspended {
        return "suspended".to_string();
    }
    if let Some(dep) = &unit.blocked_by {
        return format!("waiting for dependency '{dep}'");
    }
    match unit.status {
        UnitStatus::Pending => "waiting for first apply".to_string(),
        UnitStatus::Applying => "apply in progress".to_string(),
        UnitStatus::Ready => "ready".to_string(),
        UnitStatus::Failed | UnitStatus::Stalled => match &unit.last_error {
            Some(err) => format!("{}: {err}", unit.status),
            None => unit.status.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::UnitDeclaration;
    use std::time::Duration;

    fn graph() -> DependencyGraph {
        let decls = vec![
            UnitDeclaration::new("infra", "./infrastructure", Duration::from_secs(600)),
            UnitDeclaration::new("image-auto", "./image-automation", Duration::from_secs(1800)),
            UnitDeclaration::new("apps", "./apps", Duration::from_secs(600))
                .depends_on(["infra", "image-auto"]),
        ];
        DependencyGraph::build(&decls, 3).unwrap()
    }

    fn record(name: &str, status: UnitStatus) -> UnitRecord {
        let mut r = UnitRecord::new(name, Utc::now());
        r.status = status;
        r
    }

    #[test]
    fn all_ready_is_healthy() {
        let records = [
            record("infra", UnitStatus::Ready),
            record("image-auto", UnitStatus::Ready),
            record("apps", UnitStatus::Ready),
        ];
        let snap = StatusSnapshot::build(&graph(), records.iter().map(|r| (r, false)));
        assert!(snap.health.is_ready());
        assert_eq!(snap.generation(), 3);
        assert_eq!(snap.units.len(), 3);
        assert_eq!(snap.units.last().unwrap().name, "apps");
    }

    #[test]
    fn health_names_first_blocking_unit_in_order() {
        let mut infra = record("infra", UnitStatus::Stalled);
        infra.last_error = Some("target unavailable: connection refused".to_string());
        let records = [
            infra,
            record("image-auto", UnitStatus::Ready),
            record("apps", UnitStatus::Pending),
        ];
        let snap = StatusSnapshot::build(&graph(), records.iter().map(|r| (r, false)));
        match &snap.health {
            Health::Blocked {
                unit,
                status,
                reason,
            } => {
                assert_eq!(unit, "infra");
                assert_eq!(*status, UnitStatus::Stalled);
                assert!(reason.starts_with("Stalled: target unavailable"), "{reason}");
            }
            Health::Ready => panic!("expected blocked health"),
        }
        assert_eq!(
            snap.unit("apps").unwrap().blocked_by.as_deref(),
            Some("infra")
        );
        assert!(snap.unit("image-auto").unwrap().blocked_by.is_none());
    }

    #[test]
    fn suspended_unit_blocks_dependents() {
        let records = [
            record("infra", UnitStatus::Ready),
            record("image-auto", UnitStatus::Ready),
            record("apps", UnitStatus::Pending),
        ];
        let snap = StatusSnapshot::build(
            &graph(),
            records.iter().map(|r| (r, r.name == "image-auto")),
        );
        assert_eq!(
            snap.unit("apps").unwrap().blocked_by.as_deref(),
            Some("image-auto")
        );
        assert!(matches!(
            &snap.health,
            Health::Blocked { unit, reason, .. } if unit == "image-auto" && reason == "suspended"
        ));
    }

    #[test]
    fn empty_snapshot_is_ready() {
        let snap = StatusSnapshot::default();
        assert!(snap.health.is_ready());
        assert!(snap.units.is_empty());
    }

    #[test]
    fn json_uses_camel_case_fields() {
        let records = [record("infra", UnitStatus::Ready)];
        let g = DependencyGraph::build(
            &[UnitDeclaration::new("infra", "./infrastructure", Duration::from_secs(60))],
            1,
        )
        .unwrap();
        let snap = StatusSnapshot::build(&g, records.iter().map(|r| (r, false)));
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json["units"][0].get("lastTransitionTime").is_some());
        assert_eq!(json["health"]["state"], "ready");
    }
}
