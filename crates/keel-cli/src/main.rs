mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "Stage, bootstrap, and upsert batches into snapshot tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ingestion pipeline
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Print the outcome as a single JSON object
        #[arg(long)]
        json: bool,
    },
    /// Validate pipeline configuration, catalog, and input without writing
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Print the rows of the pipeline's target table
    Show {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Read this snapshot instead of the current one
        #[arg(long)]
        snapshot: Option<i64>,
        /// Maximum rows to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List the target table's snapshots and recent pipeline runs
    History {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Maximum runs to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { pipeline, json } => commands::run::execute(&pipeline, json).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Show {
            pipeline,
            snapshot,
            limit,
        } => commands::show::execute(&pipeline, snapshot, limit),
        Commands::History { pipeline, limit } => commands::history::execute(&pipeline, limit),
    }
}
