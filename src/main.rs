use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use enhancer::config::EnhancerConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "enhancer")]
#[command(version, about = "Turn queued enhancement requests into agent-generated pull requests")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file (defaults to .enhancer/enhancer.toml under the project dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Add an enhancement request to the queue
    Enqueue {
        #[arg(short, long)]
        summary: String,
        #[arg(short, long)]
        details: String,
    },
    /// List queued enhancement requests
    List {
        /// Only show requests with this status (new, pr-submitted, error)
        #[arg(long)]
        status: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Reset a finished request to `new`
    Requeue { id: String },
    /// Run one enhancement cycle in the foreground
    Cycle,
    /// Run cycles until the queue has no `new` requests
    Drain {
        #[arg(long, default_value = "10")]
        max_cycles: usize,
        /// Seconds to wait between cycles
        #[arg(long, default_value = "30")]
        interval: u64,
    },
    /// Ask a chat model for enhancement ideas and queue them
    Suggest {
        /// Directory to scan (defaults to the project dir)
        #[arg(long)]
        code_dir: Option<PathBuf>,
        #[arg(long)]
        max_files: Option<usize>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration (secrets masked)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default enhancer.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = EnhancerConfig::load(project_dir, cli.config.clone())?;
    let _log_guard = enhancer::logging::init_logging(&config, cli.verbose)?;

    match &cli.command {
        Commands::Serve { dev } => cmd::cmd_serve(&config, *dev).await?,
        Commands::Enqueue { summary, details } => {
            cmd::cmd_enqueue(&config, summary, details).await?
        }
        Commands::List { status, json } => cmd::cmd_list(&config, status.as_deref(), *json).await?,
        Commands::Requeue { id } => cmd::cmd_requeue(&config, id).await?,
        Commands::Cycle => cmd::cmd_cycle(&config).await?,
        Commands::Drain {
            max_cycles,
            interval,
        } => cmd::cmd_drain(&config, *max_cycles, *interval).await?,
        Commands::Suggest {
            code_dir,
            max_files,
        } => cmd::cmd_suggest(&config, code_dir.clone(), *max_files).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
