//! Companion CLI - Manage the Semantic Engine's local services
//!
//! A command-line front end for the orchestrator core: report where the
//! companion services are running, bring them up, and inspect the
//! configuration.

mod commands;

use clap::{Parser, Subcommand};
use companion_core::ConfigStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "companion")]
#[command(author, version, about = "Manage the Semantic Engine companion services")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report where each configured service is reachable (read-only)
    #[command(alias = "st")]
    Status,

    /// Ensure all services are running; keeps launched services alive
    /// until interrupted
    Up,

    /// Show current configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let store = ConfigStore::new()?;
    let config = store.load().await?;

    match cli.command {
        Some(Commands::Up) => commands::up::run(config, cli.json).await?,
        Some(Commands::Config) => commands::config::show(&store, &config, cli.json)?,
        // Status is the default, matching what a user checking on the
        // services most often wants.
        Some(Commands::Status) | None => commands::status::run(config, cli.json).await?,
    }

    Ok(())
}
