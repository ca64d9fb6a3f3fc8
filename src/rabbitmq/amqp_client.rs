// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::channel_manager::{ChannelConfig, ChannelManager};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::lapin_transport::LapinConnector;
use super::publisher::{route, OutgoingMessage, Payload, PublishMode};
use super::transport::{BrokerConnection, Connector, ExchangeType, QueueOptions};
use crate::config::BrokerConfig;
use crate::message::MessageProperties;

/// Owns the broker connection and a lazily opened default channel.
///
/// One client per process; the consumer loop and the RPC engine take it by `Arc`
/// and open their own channels through it.
pub struct AmqpClient {
    connection: ConnectionManager,
    default_channel: Mutex<Option<ChannelManager>>,
}

impl AmqpClient {
    /// Client backed by lapin.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_connector(config, Arc::new(LapinConnector))
    }

    pub fn with_connector(config: BrokerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connection: ConnectionManager::new(config, connector),
            default_channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        self.connection.config()
    }

    /// Returns the memoized connection, opening it on first use.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.connection.get_connection().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// The default channel (prefetch 1), opened on first use.
    pub async fn channel(&self) -> Result<ChannelManager> {
        let mut slot = self.default_channel.lock().await;
        if let Some(channel) = slot.as_ref().filter(|channel| channel.is_healthy()) {
            return Ok(channel.clone());
        }

        let channel = self.open_channel(ChannelConfig::named("default")).await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// A new dedicated channel on the shared connection.
    pub async fn open_channel(&self, config: ChannelConfig) -> Result<ChannelManager> {
        let connection = self.connect().await?;
        ChannelManager::open(connection.as_ref(), config).await
    }

    /// Declares a durable exchange, a durable queue of the same name, and binds them.
    pub async fn declare_exchange(&self, name: &str, delayed: bool) -> Result<()> {
        if name.trim().is_empty() {
            return Err(RabbitMQError::InvalidArgument(
                "exchange name cannot be empty".to_string(),
            ));
        }

        let kind = if delayed {
            ExchangeType::delayed()
        } else {
            ExchangeType::Direct
        };
        let channel = self.channel().await?;
        let channel = channel.channel();

        channel.exchange_declare(name, &kind).await?;
        channel.queue_declare(name, QueueOptions::durable()).await?;
        channel.queue_bind(name, name, "").await?;

        info!(exchange = name, kind = kind.kind_name(), "Declared exchange and queue");
        Ok(())
    }

    /// Publishes `payload` to `target` in `mode`, on `channel` or the default channel.
    ///
    /// In [`PublishMode::ReplyCallback`] `target` is the reply queue name. In
    /// [`PublishMode::Batch`] nothing is sent until [`AmqpClient::flush_batch`].
    pub async fn publish(
        &self,
        target: &str,
        payload: impl Into<Payload>,
        properties: MessageProperties,
        mode: PublishMode,
        channel: Option<&ChannelManager>,
    ) -> Result<()> {
        let message = payload.into().into_message(properties)?;
        let channel = match channel {
            Some(channel) => channel.clone(),
            None => self.channel().await?,
        };
        let (exchange, routing_key) = route(target, mode);

        match mode {
            PublishMode::Batch => {
                channel.stage(OutgoingMessage::new(exchange, routing_key, message))?;
                debug!(channel_id = channel.id(), exchange, staged = channel.staged(), "Staged publish");
            }
            PublishMode::Direct | PublishMode::ReplyCallback => {
                channel
                    .channel()
                    .basic_publish(exchange, routing_key, &message)
                    .await
                    .map_err(|err| match err {
                        RabbitMQError::ChannelError(reason) => RabbitMQError::PublishError(reason),
                        other => other,
                    })?;
                debug!(channel_id = channel.id(), exchange, routing_key, "Published message");
            }
        }
        Ok(())
    }

    /// Sends everything staged on `channel` (or the default channel). Returns the count sent.
    pub async fn flush_batch(&self, channel: Option<&ChannelManager>) -> Result<usize> {
        match channel {
            Some(channel) => channel.flush().await,
            None => self.channel().await?.flush().await,
        }
    }

    /// Closes the default channel and the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let channel = self.default_channel.lock().await.take();
        let channel_result = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };

        self.connection.close().await?;
        channel_result
    }
}
