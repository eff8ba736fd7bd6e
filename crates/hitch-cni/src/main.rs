//! Hitch CNI plugin entry point.

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use hitch_cni::cli::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments and the CNI environment
    let cli = Cli::parse();

    // Initialize tracing
    cli.init_logging()?;

    // Execute command
    cli.execute().await
}
