pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or resume) a harvest run
    Run {
        /// YAML list of village locations to sweep
        #[arg(long, required = true)]
        villages: PathBuf,

        /// Owner name to search for
        #[arg(long, required = true)]
        owner: String,

        /// Additional spelling of the owner name (repeatable)
        #[arg(long = "variant")]
        variants: Vec<String>,

        /// Number of worker processes
        #[arg(short, long)]
        workers: Option<u32>,

        /// Highest survey number to try in each village
        #[arg(long)]
        max_survey: Option<u32>,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Resume this session instead of starting a new one
        #[arg(long)]
        session: Option<String>,
    },

    /// Worker process entry point, spawned by `run`
    #[command(hide = true)]
    Worker {
        #[arg(long, required = true)]
        session: String,

        #[arg(long, required = true)]
        worker_id: u32,

        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Show the state of a session
    Status {
        /// Session ID to check
        #[arg(required = true)]
        session: String,

        #[arg(short, long)]
        profile: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List surveys and combinations that were skipped in a session
    Skipped {
        #[arg(required = true)]
        session: String,

        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let verbose = cli.verbose;
    let log_file = cli.log_file;

    match cli.command {
        Commands::Run { villages, owner, variants, workers, max_survey, profile, session } => {
            info!("Starting harvest for '{}' over {}", owner, villages.display());
            commands::run(commands::RunArgs {
                villages,
                owner,
                variants,
                workers,
                max_survey,
                profile,
                session,
                verbose,
                log_file,
            })
            .await
        },
        Commands::Worker { session, worker_id, profile } => {
            commands::worker(session, worker_id, profile).await
        },
        Commands::Status { session, profile, json } => {
            commands::status(session, profile, json).await
        },
        Commands::Skipped { session, profile } => {
            commands::skipped(session, profile).await
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config().await
            }
        },
    }
}
