use crate::output::{format_time, print_json, print_table, short_revision};
use anyhow::Context;
use fluxorder_core::{
    config::Config,
    declaration::load_declarations,
    graph::DependencyGraph,
    paths,
    status::{Health, StatusSnapshot, UnitStatusView},
    store::StatusStore,
    unit::UnitRecord,
    FluxError, UnitStatus,
};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// Unhealthy: typed non-zero exit, mapped to a process exit code by main
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Unhealthy {
    pub unit: String,
    pub status: UnitStatus,
    pub reason: String,
}

impl Unhealthy {
    pub fn exit_code(&self) -> i32 {
        2
    }
}

impl fmt::Display for Unhealthy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "not ready: unit '{}' is {} ({})",
            self.unit, self.status, self.reason
        )
    }
}

impl std::error::Error for Unhealthy {}

// ---------------------------------------------------------------------------
// get-status
// ---------------------------------------------------------------------------

/// Build a snapshot from declarations on disk and persisted records without
/// touching the target. Declared units with no record yet show as `Pending`.
pub fn load_snapshot(root: &Path) -> anyhow::Result<StatusSnapshot> {
    let config = Config::load(root).context("failed to load config")?;
    let decls =
        load_declarations(&config.units_dir(root)).context("failed to load declarations")?;
    let graph = DependencyGraph::build(&decls, 1).context("invalid declaration set")?;

    let store =
        StatusStore::open(&paths::state_db_path(root)).context("failed to open state store")?;
    let mut stored: HashMap<String, UnitRecord> = store
        .load_all()
        .context("failed to read unit records")?
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();

    let now = chrono::Utc::now();
    let records: Vec<(UnitRecord, bool)> = decls
        .iter()
        .map(|d| {
            let record = stored
                .remove(&d.name)
                .unwrap_or_else(|| UnitRecord::new(&d.name, now));
            (record, d.suspend)
        })
        .collect();

    Ok(StatusSnapshot::build(
        &graph,
        records.iter().map(|(r, suspended)| (r, *suspended)),
    ))
}

pub fn run(root: &Path, unit: Option<&str>, json: bool) -> anyhow::Result<()> {
    let snapshot = load_snapshot(root)?;

    match unit {
        Some(name) => {
            let view = snapshot
                .unit(name)
                .ok_or_else(|| FluxError::UnitNotFound(name.to_string()))?;
            if json {
                print_json(view)?;
            } else {
                print_unit(view);
            }
            if view.suspended || view.status != UnitStatus::Ready {
                return Err(Unhealthy {
                    unit: view.name.clone(),
                    status: view.status,
                    reason: unit_reason(view),
                }
                .into());
            }
        }
        None => {
            if json {
                print_json(&snapshot)?;
            } else {
                print_summary(&snapshot);
            }
            if let Health::Blocked {
                unit,
                status,
                reason,
            } = snapshot.health
            {
                return Err(Unhealthy {
                    unit,
                    status,
                    reason,
                }
                .into());
            }
        }
    }
    Ok(())
}

fn unit_reason(view: &UnitStatusView) -> String {
    if view.suspended {
        return "suspended".to_string();
    }
    if let Some(dep) = &view.blocked_by {
        return format!("waiting for dependency '{dep}'");
    }
    view.last_error
        .clone()
        .unwrap_or_else(|| view.status.to_string())
}

fn print_summary(snapshot: &StatusSnapshot) {
    if snapshot.units.is_empty() {
        println!("No units declared.");
        return;
    }
    let rows = snapshot
        .units
        .iter()
        .map(|u| {
            let status = if u.suspended {
                format!("{} (suspended)", u.status)
            } else {
                u.status.to_string()
            };
            vec![
                u.name.clone(),
                status,
                short_revision(u.last_applied_revision.as_deref()),
                format_time(Some(u.last_transition_time)),
                u.blocked_by.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(
        &["UNIT", "STATUS", "REVISION", "LAST TRANSITION", "BLOCKED BY"],
        rows,
    );
    if let Health::Blocked { unit, reason, .. } = &snapshot.health {
        println!("\nBlocked: {unit}: {reason}");
    }
}

fn print_unit(view: &UnitStatusView) {
    println!("Unit:            {}", view.name);
    println!("Status:          {}", view.status);
    if view.suspended {
        println!("Suspended:       yes");
    }
    println!(
        "Revision:        {}",
        view.last_applied_revision.as_deref().unwrap_or("-")
    );
    println!(
        "Last transition: {}",
        format_time(Some(view.last_transition_time))
    );
    if !view.depends_on.is_empty() {
        println!("Depends on:      {}", view.depends_on.join(", "));
    }
    if let Some(dep) = &view.blocked_by {
        println!("Blocked by:      {dep}");
    }
    if view.failure_count > 0 {
        println!("Failures:        {}", view.failure_count);
    }
    if view.next_retry_at.is_some() {
        println!("Next retry:      {}", format_time(view.next_retry_at));
    }
    if let Some(err) = &view.last_error {
        println!("Last error:      {err}");
    }
}
