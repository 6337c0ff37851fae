use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};

use burrow_proxy::config::ProxyConfig;

#[derive(Parser, Debug)]
#[command(name = "burrowd", about = "Burrow proxy - tunnel exit relay")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "proxy.toml")]
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

    info!("burrow proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = if tokio::fs::try_exists(&args.config).await.unwrap_or(false) {
        ProxyConfig::load(&args.config).await?
    } else {
        info!(path = %args.config, "config file not found, using defaults");
        ProxyConfig::default()
    };

    burrow_proxy::run(config).await
}
