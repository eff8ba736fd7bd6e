//! Hitch network monitor entry point.

use clap::Parser;
use color_eyre::eyre::Result;

use hitch_cni::cli::MonitorCli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let cli = MonitorCli::parse();

    // Initialize tracing
    cli.init_logging()?;

    cli.execute().await
}
