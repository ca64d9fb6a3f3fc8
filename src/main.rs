use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rabbitmq_bridge::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries message bodies and RPC replies.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, stopping"),
            Err(err) => {
                warn!("Unable to listen for Ctrl-C: {}", err);
                futures::future::pending::<()>().await
            }
        }
    };

    cli::run(cli, shutdown).await
}
