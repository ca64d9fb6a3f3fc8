// src/cli.rs

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{create_default_config_file, load_config, ConsumerSettings, CONFIG_FILE_NAME};
use crate::consumers::sample::{SampleConsumer, SAMPLE_EXCHANGE};
use crate::message::MessageProperties;
use crate::rabbitmq::{AmqpClient, ConsumerLoop, RpcClient};

#[derive(Debug, Parser)]
#[command(name = "rabbitmq-bridge", version, about = "Exchanges, consumers and RPC calls over RabbitMQ")]
pub struct Cli {
    /// Configuration file; discovered in the working directory or home when omitted
    #[arg(long, global = true, env = "RABBITMQ_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Declare exchanges
    Exchange {
        #[command(subcommand)]
        command: ExchangeCommand,
    },
    /// Run a consumer until stopped
    Consumer {
        #[command(subcommand)]
        command: ConsumerCommand,
    },
    /// Request/response calls
    Rpc {
        #[command(subcommand)]
        command: RpcCommand,
    },
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ExchangeCommand {
    /// Declare each exchange with a durable queue of the same name bound to it
    Create {
        /// Declare x-delayed-message exchanges
        #[arg(long)]
        delayed: bool,

        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConsumerCommand {
    /// Print every message from "consume-me" and answer RPC requests with their own payload
    Sample {
        /// Stop after this many messages (0 = unlimited)
        #[arg(long)]
        limit: Option<u64>,

        /// Exchange receiving failure reports
        #[arg(long)]
        error_exchange: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RpcCommand {
    /// Send one JSON request and print the raw reply
    Call {
        /// Give up after this many milliseconds instead of waiting forever
        #[arg(long)]
        timeout_ms: Option<u64>,

        exchange: String,

        payload: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a configuration file holding the defaults
    Init { path: Option<PathBuf> },
}

/// Runs `cli`; `shutdown` stops a running consumer.
pub async fn run<F>(cli: Cli, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let command = match cli.command {
        Command::Config {
            command: ConfigCommand::Init { path },
        } => {
            let path = path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            create_default_config_file(&path)?;
            println!("Configuration written to {}", path.display());
            return Ok(());
        }
        command => command,
    };

    let config = load_config(cli.config.as_deref())?;
    info!("Using broker {}", config.broker.redacted_uri());
    let client = Arc::new(AmqpClient::new(config.broker.clone()));

    execute(command, client, &config.consumer, shutdown).await
}

/// Runs a broker-facing command on `client`. The client is closed before returning.
pub async fn execute<F>(
    command: Command,
    client: Arc<AmqpClient>,
    settings: &ConsumerSettings,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match command {
        Command::Exchange {
            command: ExchangeCommand::Create { delayed, names },
        } => {
            let result = create_exchanges(&client, &names, delayed).await;
            if let Err(err) = client.close().await {
                warn!("Failed to close connection: {}", err);
            }
            result
        }
        Command::Consumer {
            command: ConsumerCommand::Sample { limit, error_exchange },
        } => {
            let consumer = SampleConsumer::new(client.clone())
                .with_error_exchange(error_exchange.or_else(|| settings.error_exchange.clone()));
            let mut consumer_loop = ConsumerLoop::new(client, consumer)
                .with_process_limit(limit.or(settings.process_limit))
                .with_shutdown(shutdown);

            let report = consumer_loop.run().await.with_context(|| {
                format!("consumer on '{}' failed (is the exchange declared?)", SAMPLE_EXCHANGE)
            })?;
            info!(
                processed = report.processed,
                acked = report.acked,
                rejected = report.rejected,
                requeued = report.requeued,
                failed = report.failed,
                exit = ?report.exit,
                "Consumer stopped"
            );
            Ok(())
        }
        Command::Rpc {
            command: RpcCommand::Call { timeout_ms, exchange, payload },
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("request payload is not valid JSON")?;
            let mut rpc = RpcClient::new(client.clone());

            let result = match timeout_ms {
                Some(ms) => {
                    rpc.direct_request_within(&exchange, payload, MessageProperties::default(), Duration::from_millis(ms))
                        .await
                }
                None => {
                    rpc.direct_request(&exchange, payload, MessageProperties::default())
                        .await
                }
            };

            if let Err(err) = rpc.close().await {
                warn!("Failed to close RPC channel: {}", err);
            }
            if let Err(err) = client.close().await {
                warn!("Failed to close connection: {}", err);
            }

            let reply = result.with_context(|| format!("RPC call to '{}' failed", exchange))?;
            println!("{}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        Command::Config { .. } => Err(anyhow::anyhow!("config commands do not use the broker")),
    }
}

async fn create_exchanges(client: &AmqpClient, names: &[String], delayed: bool) -> Result<()> {
    for name in names {
        client
            .declare_exchange(name, delayed)
            .await
            .with_context(|| format!("failed to create exchange '{}'", name))?;
        println!("Exchange {} created.", name);
    }
    Ok(())
}
