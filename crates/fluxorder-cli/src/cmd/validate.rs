use crate::output::print_json;
use anyhow::Context;
use fluxorder_core::{
    config::{Config, WarnLevel},
    declaration::load_declarations,
    graph::DependencyGraph,
};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);

    let units_dir = config.units_dir(root);
    let decls = load_declarations(&units_dir)
        .with_context(|| format!("failed to load declarations from {}", units_dir.display()))?;
    let graph = DependencyGraph::build(&decls, 1);

    if json {
        let value = match &graph {
            Ok(g) => serde_json::json!({
                "warnings": warnings,
                "units": g.len(),
                "order": g.order(),
            }),
            Err(e) => serde_json::json!({
                "warnings": warnings,
                "error": e.to_string(),
            }),
        };
        print_json(&value)?;
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
        if let Ok(g) = &graph {
            if g.is_empty() {
                println!("No units declared in {}.", units_dir.display());
            } else {
                println!("Apply order ({} units):", g.len());
                for (i, name) in g.order().iter().enumerate() {
                    println!("  {}. {name}", i + 1);
                }
            }
        }
    }

    graph.context("invalid declaration set")?;
    if has_errors {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

