use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use fluxorder_core::{
    config::Config,
    image::{update_sources, PolicyRule, SortOrder},
};
use std::path::Path;

#[derive(Subcommand)]
pub enum ImageSubcommand {
    /// List configured image policies
    List,

    /// Pick the newest candidate tag and rewrite marked source lines
    Update {
        /// Policy name from config.yaml
        policy: String,

        /// Candidate tag (repeatable)
        #[arg(long = "tag", required = true, num_args = 1..)]
        tags: Vec<String>,
    },
}

pub fn run(root: &Path, subcmd: ImageSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ImageSubcommand::List => list(root, json),
        ImageSubcommand::Update { policy, tags } => update(root, &policy, &tags, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        return print_json(&config.image_policies);
    }
    if config.image_policies.is_empty() {
        println!("No image policies configured.");
        return Ok(());
    }
    let rows = config
        .image_policies
        .iter()
        .map(|p| vec![p.key(), p.image.clone(), describe(&p.policy)])
        .collect();
    print_table(&["POLICY", "IMAGE", "RULE"], rows);
    Ok(())
}

fn update(root: &Path, name: &str, tags: &[String], json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let policy = config
        .image_policy(name)
        .with_context(|| format!("image policy '{name}' not found in config"))?;
    let tag = policy
        .select_latest(tags)?
        .with_context(|| format!("no candidate tag satisfies policy '{name}'"))?;

    let source_root = config.source_root(root);
    let changed = update_sources(&source_root, policy, &tag)
        .with_context(|| format!("failed to update sources under {}", source_root.display()))?;

    if json {
        print_json(&serde_json::json!({
            "policy": policy.key(),
            "image": policy.image,
            "tag": tag,
            "updated": changed,
        }))?;
    } else if changed.is_empty() {
        println!("{}:{tag} already current; no files changed.", policy.image);
    } else {
        println!("{}:{tag}", policy.image);
        for path in &changed {
            let shown = path.strip_prefix(root).unwrap_or(path);
            println!("  updated: {}", shown.display());
        }
    }
    Ok(())
}

fn describe(rule: &PolicyRule) -> String {
    let order = |o: &SortOrder| match o {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    };
    match rule {
        PolicyRule::Semver { range } => format!("semver {range}"),
        PolicyRule::Alphabetical { order: o } => format!("alphabetical {}", order(o)),
        PolicyRule::Numerical { order: o } => format!("numerical {}", order(o)),
    }
}
