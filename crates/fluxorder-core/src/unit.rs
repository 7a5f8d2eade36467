use crate::resource::AppliedSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// UnitStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a unit.
///
/// Transitions: `Pending → Applying → Ready | Failed`, `Failed → Applying`
/// (retry), `Failed → Stalled` once the failure threshold is reached, and
/// `Stalled → Pending` when the declaration or source changes or a manual
/// reconcile arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    Pending,
    Applying,
    Ready,
    Failed,
    Stalled,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "Pending",
            UnitStatus::Applying => "Applying",
            UnitStatus::Ready => "Ready",
            UnitStatus::Failed => "Failed",
            UnitStatus::Stalled => "Stalled",
        }
    }

    /// Failed and stalled units block their dependents.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, UnitStatus::Failed | UnitStatus::Stalled)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Why a unit should be evaluated ahead of its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The source collaborator reported new content.
    SourceChanged,
    /// Live state was observed to diverge from the last apply.
    Drift,
    /// The unit's declaration was edited.
    DeclarationChanged,
    /// Operator-requested reconcile. Forces an apply and clears a stall.
    Manual,
}

impl Trigger {
    /// Whether this trigger applies even when the source revision matches
    /// the last applied one.
    pub fn forces_apply(&self) -> bool {
        matches!(self, Trigger::Drift | Trigger::Manual)
    }
}

// ---------------------------------------------------------------------------
// UnitRecord
// ---------------------------------------------------------------------------

/// Engine-owned bookkeeping for one unit. This is the part of a unit that
/// survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub name: String,
    pub status: UnitStatus,
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    /// Revision of the most recent attempt, successful or not.
    #[serde(default)]
    pub last_attempted_revision: Option<String>,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub applied: Option<AppliedSet>,
    /// Prune policy `applied` was written under, so a unit whose
    /// declaration vanished between runs can still be cleaned up.
    #[serde(default)]
    pub prune: bool,
}

impl UnitRecord {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: UnitStatus::Pending,
            last_applied_revision: None,
            last_attempted_revision: None,
            last_transition_time: now,
            last_checked_at: None,
            failure_count: 0,
            next_retry_at: None,
            last_error: None,
            applied: None,
            prune: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub unit: String,
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}
