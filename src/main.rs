use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hostprobe::agent::{self, Runtime};
use hostprobe::config::Config;

#[derive(Parser, Debug)]
#[command(name = "hostprobe", about = "Active probing agent for Mackerel-style monitoring")]
struct Cli {
    /// Configuration location: file path, http(s):// URL, or s3://bucket/key
    #[arg(short, long, default_value = "/etc/hostprobe/config.yaml")]
    config: String,

    /// Run a single probe cycle and exit
    #[arg(long)]
    once: bool,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("hostprobe {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging(&cli.log_level);

    if cli.check {
        Config::load(&cli.config).await?;
        println!("Configuration is valid.");
        return Ok(());
    }

    let runtime = Arc::new(Runtime::default());
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            signal_cancel.cancel();
        }
    });

    if let Err(e) = agent::run(runtime, &cli.config, cli.once, cancel).await {
        error!(error = %e, "agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
