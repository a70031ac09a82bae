use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "sprig",
    about = "Event and persistence backbone for hydroponic device orchestration",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a site, attach its devices and run until interrupted.
    Run {
        /// Path to the site directory.
        site_dir: PathBuf,

        /// Property store file.
        #[arg(long, default_value = "sprig-store.json")]
        store_path: PathBuf,

        /// Persistence flush cadence in milliseconds.
        #[arg(long, default_value_t = 1000)]
        batch_interval_ms: u64,

        /// Async dispatch pool size. With 1, async handlers observe
        /// publish order.
        #[arg(long, default_value_t = 4)]
        dispatch_workers: usize,
    },

    /// Render the declared topology.
    Graph {
        /// Path to the site directory.
        site_dir: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        output: GraphOutput,
    },

    /// List persisted components and their state.
    Status {
        /// Property store file.
        #[arg(long, default_value = "sprig-store.json")]
        store_path: PathBuf,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum GraphOutput {
    Text,
    Json,
    Dot,
}
