use crate::output::{print_json, print_table};
use anyhow::Context;
use fluxorder_core::{
    config::Config,
    declaration::{format_interval, load_declarations, UnitDeclaration},
    graph::DependencyGraph,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphEntry<'a> {
    name: &'a str,
    depends_on: &'a [String],
    /// Everything that must be Ready first, in apply order.
    requires: Vec<String>,
    interval: String,
    prune: bool,
    suspend: bool,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let decls = load_declarations(&config.units_dir(root)).context("failed to load declarations")?;
    let graph = DependencyGraph::build(&decls, 1).context("invalid declaration set")?;
    let by_name: HashMap<&str, &UnitDeclaration> =
        decls.iter().map(|d| (d.name.as_str(), d)).collect();

    let entries: Vec<GraphEntry<'_>> = graph
        .order()
        .iter()
        .filter_map(|name| by_name.get(name.as_str()))
        .map(|decl| GraphEntry {
            name: &decl.name,
            depends_on: graph.dependencies(&decl.name),
            requires: graph.transitive_dependencies(&decl.name),
            interval: format_interval(decl.interval),
            prune: decl.prune,
            suspend: decl.suspend,
        })
        .collect();

    if json {
        return print_json(&entries);
    }

    if entries.is_empty() {
        println!("No units declared.");
        return Ok(());
    }

    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.name.to_string(),
                if e.depends_on.is_empty() {
                    "-".to_string()
                } else {
                    e.depends_on.join(", ")
                },
                e.interval.clone(),
                yes_no(e.prune),
                yes_no(e.suspend),
            ]
        })
        .collect();
    print_table(&["UNIT", "DEPENDS ON", "INTERVAL", "PRUNE", "SUSPENDED"], rows);
    Ok(())
}

fn yes_no(v: bool) -> String {
    let s = if v { "yes" } else { "no" };
    s.to_string()
}
