pub mod graph;
pub mod image;
pub mod init;
pub mod reconcile;
pub mod run;
pub mod status;
pub mod validate;

use anyhow::Context;
use fluxorder_core::{
    apply::DirectoryApplier,
    config::Config,
    declaration::{load_declarations, UnitDeclaration},
    paths,
    render::OverlayRenderer,
    source::DirectorySource,
    store::StatusStore,
    Engine, EngineSettings,
};
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs to drive the engine against a repository.
pub struct Workspace {
    pub config: Config,
    pub store: StatusStore,
    pub engine: Engine,
}

impl Workspace {
    /// Load config, open the state store and build an engine over the
    /// directory-backed collaborators with persisted records restored.
    /// Declarations are not loaded yet.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let config = Config::load(root).context("failed to load config")?;
        let store = StatusStore::open(&paths::state_db_path(root))
            .context("failed to open state store")?;
        let recovered = store
            .startup_recovery()
            .context("failed to recover state store")?;
        if recovered > 0 {
            tracing::warn!(recovered, "units were left mid-apply by a previous run");
        }

        let mut engine = Engine::new(
            Arc::new(DirectorySource::new(config.source_root(root))),
            Arc::new(OverlayRenderer),
            Arc::new(DirectoryApplier::new(config.target_dir(root))),
            EngineSettings::from_config(&config),
        );
        engine.restore(store.load_all().context("failed to read unit records")?);

        Ok(Self {
            config,
            store,
            engine,
        })
    }

    pub fn declarations(&self, root: &Path) -> anyhow::Result<Vec<UnitDeclaration>> {
        let dir = self.config.units_dir(root);
        load_declarations(&dir)
            .with_context(|| format!("failed to load declarations from {}", dir.display()))
    }

    /// Replace the engine's declaration set with what is on disk.
    pub async fn reload(&mut self, root: &Path) -> anyhow::Result<()> {
        let decls = self.declarations(root)?;
        let report = self
            .engine
            .load(decls)
            .await
            .context("declaration set rejected")?;
        for name in &report.pruned {
            tracing::info!(unit = %name, "removed unit pruned");
        }
        Ok(())
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        self.store
            .save_all(self.engine.records())
            .context("failed to persist unit records")
    }
}

/// Run an async command body on a fresh runtime.
pub fn block_on<F, T>(fut: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(fut)
}
