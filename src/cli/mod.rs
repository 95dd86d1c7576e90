//! Command-line interface.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "ctxflow")]
#[command(about = "Queue-driven worker for multi-stage context pipelines")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML, YAML, or JSON). Discovered if omitted.
    #[arg(short, long, global = true, env = "CTXFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker until interrupted
    Run {
        /// Override the worker id
        #[arg(long)]
        worker_id: Option<String>,
        /// Override the number of units processed at once
        #[arg(long)]
        concurrency: Option<usize>,
        /// Enable batch polling
        #[arg(long)]
        batch: bool,
    },

    /// Submit a context for processing
    Submit {
        /// Template id
        #[arg(short, long)]
        template: String,
        /// Priority (higher runs first)
        #[arg(short, long, default_value = "0")]
        priority: i32,
        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,
        /// Batch id
        #[arg(long)]
        batch_id: Option<String>,
        /// Organization id
        #[arg(long)]
        organization: Option<String>,
        /// Service type
        #[arg(long)]
        service_type: Option<String>,
        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Show a context as JSON
    Show {
        /// Context id
        id: String,
    },

    /// Show pending work and configured flows
    Status,

    /// Create or update the database schema
    Migrate,
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run {
            worker_id,
            concurrency,
            batch,
        } => {
            let mut config = config;
            if let Some(id) = worker_id {
                config.worker.worker_id = id;
            }
            if let Some(n) = concurrency {
                config.worker.max_concurrent = n.max(1);
            }
            if batch {
                config.worker.batch_processing_enabled = true;
            }
            config.validate()?;
            commands::cmd_run(&config).await
        }
        Commands::Submit {
            template,
            priority,
            metadata,
            batch_id,
            organization,
            service_type,
            tags,
        } => {
            let submission = commands::Submission {
                template,
                priority,
                metadata,
                batch_id,
                organization,
                service_type,
                tags,
            };
            commands::cmd_submit(&config, submission).await
        }
        Commands::Show { id } => commands::cmd_show(&config, &id).await,
        Commands::Status => commands::cmd_status(&config).await,
        Commands::Migrate => commands::cmd_migrate(&config).await,
    }
}
