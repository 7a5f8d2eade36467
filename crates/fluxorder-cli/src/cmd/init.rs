use anyhow::Context;
use fluxorder_core::{config::Config, io, paths, store::StatusStore};
use std::path::Path;

const EXAMPLE_UNIT: &str = "\
# Units are Flux Kustomization documents. Uncomment and adjust:
#
# apiVersion: kustomize.toolkit.fluxcd.io/v1
# kind: Kustomization
# metadata:
#   name: infra
# spec:
#   interval: 10m
#   path: ./infrastructure
#   prune: true
";

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing fluxorder in: {}", root.display());

    for dir in [paths::FLUXORDER_DIR, paths::UNITS_DIR, paths::CLUSTER_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let example = root.join(paths::UNITS_DIR).join("example.yaml.sample");
    if io::write_if_missing(&example, EXAMPLE_UNIT.as_bytes())
        .context("failed to write example unit")?
    {
        println!("  created: {}/example.yaml.sample", paths::UNITS_DIR);
    }

    let db_path = paths::state_db_path(root);
    let existed = db_path.exists();
    StatusStore::open(&db_path).context("failed to create state store")?;
    if existed {
        println!("  exists:  {}", paths::STATE_DB_FILE);
    } else {
        println!("  created: {}", paths::STATE_DB_FILE);
    }

    Ok(())
}
