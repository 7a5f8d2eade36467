mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::image::ImageSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fluxorder",
    about = "Dependency-ordered reconciliation of declarative units with drift correction",
    version,
    propagate_version = true
)]
struct Cli {
    /// Repository root (default: auto-detect from .fluxorder/ or .git/)
    #[arg(long, global = true, env = "FLUXORDER_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold .fluxorder/ (config, units directory, state store)
    Init,

    /// Check the config and unit declarations; print the apply order
    Validate,

    /// List units with their dependencies in apply order
    Graph,

    /// Print unit status; exits 2 unless every unit is Ready
    GetStatus {
        /// Only show this unit
        #[arg(long)]
        unit: Option<String>,
    },

    /// Force a re-check of one unit and drive the engine until it settles
    Reconcile {
        /// Unit name
        unit: String,
    },

    /// Run the scheduling loop until interrupted
    Run {
        /// Stop once nothing is left to apply instead of polling forever
        #[arg(long)]
        once: bool,
    },

    /// Image automation policies
    Image {
        #[command(subcommand)]
        subcommand: ImageSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Validate => cmd::validate::run(&root, cli.json),
        Commands::Graph => cmd::graph::run(&root, cli.json),
        Commands::GetStatus { unit } => cmd::status::run(&root, unit.as_deref(), cli.json),
        Commands::Reconcile { unit } => cmd::reconcile::run(&root, &unit, cli.json),
        Commands::Run { once } => cmd::run::run(&root, once),
        Commands::Image { subcommand } => cmd::image::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        if let Some(unhealthy) = e.downcast_ref::<cmd::status::Unhealthy>() {
            eprintln!("{unhealthy}");
            std::process::exit(unhealthy.exit_code());
        }
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
