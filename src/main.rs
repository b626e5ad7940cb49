//! Pipeline Mock Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use pipeline_mock_server::{MockServer, MockServerConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "pipeline-mock-server",
    about = "Declarative mock HTTP server - endpoints as action pipelines",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let sample_config = include_str!("../demos/mock-server.yaml");
        println!("{}", sample_config);
        return Ok(());
    }

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    }
    info!(path = ?args.config, "Loading configuration");
    let config = MockServerConfig::from_file(&args.config)?;

    // Compiling the pipelines catches everything the loader does not
    let server = MockServer::new(config)?;

    if args.validate {
        println!(
            "Configuration is valid ({} endpoints defined)",
            server.pipelines().len()
        );
        return Ok(());
    }

    server.run().await
}
