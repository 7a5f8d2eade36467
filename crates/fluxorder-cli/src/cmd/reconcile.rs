use crate::cmd::{block_on, status::Unhealthy, Workspace};
use crate::output::print_json;
use anyhow::Context;
use fluxorder_core::{unit::Transition, Trigger, UnitStatus};
use std::path::Path;

pub fn run(root: &Path, unit: &str, json: bool) -> anyhow::Result<()> {
    let mut ws = Workspace::open(root)?;

    let (view, transitions) = block_on(async {
        ws.reload(root).await?;
        ws.engine
            .trigger(unit, Trigger::Manual)
            .with_context(|| format!("cannot reconcile '{unit}'"))?;

        // One round per graph level is enough to reach the unit; the slack
        // covers retries that become due while waiting.
        let rounds = ws.engine.graph().len() + 2;
        let result = ws.engine.run_until_quiescent(rounds).await;
        ws.persist()?;
        result.context("reconcile failed")?;

        let snapshot = ws.engine.snapshot();
        let view = snapshot
            .unit(unit)
            .cloned()
            .with_context(|| format!("unit '{unit}' disappeared during reconcile"))?;
        let transitions: Vec<Transition> = ws.engine.history().cloned().collect();
        Ok((view, transitions))
    })?;

    if json {
        print_json(&serde_json::json!({
            "unit": view,
            "transitions": transitions,
        }))?;
    } else {
        for t in &transitions {
            println!("  {}: {} -> {} ({})", t.unit, t.from, t.to, t.reason);
        }
        println!("{unit}: {}", view.status);
    }

    if view.status != UnitStatus::Ready {
        let reason = match (&view.blocked_by, &view.last_error) {
            (Some(dep), _) => format!("waiting for dependency '{dep}'"),
            (None, Some(err)) => err.clone(),
            (None, None) => view.status.to_string(),
        };
        return Err(Unhealthy {
            unit: view.name,
            status: view.status,
            reason,
        }
        .into());
    }
    Ok(())
}
