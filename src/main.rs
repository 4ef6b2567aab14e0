use anyhow::Result;
use tracing::{debug, error};

mod browser;
mod cli;
mod crawler;
mod error;
mod extract;
mod portal;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    let log_file = args.log_file.clone().unwrap_or_else(utils::logging::default_log_file);
    utils::logging::init_logging(args.verbose, Some(log_file))?;

    debug!("Starting Bhoomi harvester v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            debug!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
