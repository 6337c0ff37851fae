use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};

use burrow_agent::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "burrow", about = "Burrow agent - local SOCKS/HTTP tunnel front end")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "agent.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();

    info!("burrow agent v{}", env!("CARGO_PKG_VERSION"));

    let config = if tokio::fs::try_exists(&args.config).await.unwrap_or(false) {
        AgentConfig::load(&args.config).await?
    } else {
        info!(path = %args.config, "config file not found, using defaults");
        AgentConfig::default()
    };

    burrow_agent::run(config).await
}
