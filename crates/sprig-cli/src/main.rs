mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            site_dir,
            store_path,
            batch_interval_ms,
            dispatch_workers,
        } => commands::run(site_dir, store_path, batch_interval_ms, dispatch_workers).await,
        Command::Graph { site_dir, output } => commands::graph(site_dir, output).await,
        Command::Status { store_path } => commands::status(store_path).await,
    }
}
