use crate::cmd::{block_on, Workspace};
use chrono::Utc;
use fluxorder_core::Trigger;
use std::path::Path;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Upper bound on scheduling passes for `--once`.
const ONCE_MAX_ROUNDS: usize = 64;

pub fn run(root: &Path, once: bool) -> anyhow::Result<()> {
    let mut ws = Workspace::open(root)?;
    block_on(async move {
        if once {
            ws.reload(root).await?;
            // A one-shot pass checks every unit now instead of waiting out
            // intervals; unchanged sources still skip the apply.
            let units: Vec<String> = ws.engine.graph().order().to_vec();
            for name in &units {
                ws.engine.trigger(name, Trigger::SourceChanged)?;
            }
            let result = ws.engine.run_until_quiescent(ONCE_MAX_ROUNDS).await;
            ws.persist()?;
            result?;
            report(&ws);
            return Ok(());
        }
        run_loop(root, &mut ws).await
    })
}

async fn run_loop(root: &Path, ws: &mut Workspace) -> anyhow::Result<()> {
    let tick_every = ws.config.scheduler.tick();
    info!(root = %root.display(), tick = ?tick_every, "scheduler started");

    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A rejected declaration set keeps the previous graph running.
                if let Err(e) = ws.reload(root).await {
                    warn!(error = %format!("{e:#}"), "reload failed; keeping current graph");
                }
                match ws.engine.tick(Utc::now()).await {
                    Ok(report) if !report.dispatched.is_empty() => {
                        info!(dispatched = ?report.dispatched, blocked = ?report.blocked, "tick");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "tick failed"),
                }
                ws.persist()?;
            }
            _ = ws.engine.process_next_completion() => {
                ws.persist()?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; cancelling in-flight applies");
                break;
            }
        }
    }

    ws.engine.shutdown().await;
    ws.persist()?;
    report(ws);
    Ok(())
}

fn report(ws: &Workspace) {
    let snapshot = ws.engine.snapshot();
    for unit in &snapshot.units {
        println!("{}: {}", unit.name, unit.status);
    }
}
