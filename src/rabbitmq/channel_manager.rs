// src/rabbitmq/channel_manager.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::publisher::OutgoingMessage;
use super::transport::{BrokerChannel, BrokerConnection};

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            id: format!("channel-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// One broker channel, its QoS, and the publishes staged on it.
///
/// Cheap to clone; clones share the channel and the staged batch.
#[derive(Clone)]
pub struct ChannelManager {
    channel: Arc<dyn BrokerChannel>,
    config: ChannelConfig,
    batch: Arc<Mutex<Vec<OutgoingMessage>>>,
    closed: Arc<AtomicBool>,
}

impl ChannelManager {
    /// Opens a channel on `connection` and applies the configured prefetch.
    pub async fn open(connection: &dyn BrokerConnection, config: ChannelConfig) -> Result<Self> {
        let channel = connection.create_channel().await?;

        if config.prefetch_count > 0 {
            debug!(channel_id = %config.id, prefetch = config.prefetch_count, "Setting channel QoS");
            channel.basic_qos(config.prefetch_count).await?;
        }

        info!(channel_id = %config.id, amqp_channel = channel.id(), "Channel created and configured");
        Ok(Self::new(channel, config))
    }

    pub fn new(channel: Arc<dyn BrokerChannel>, config: ChannelConfig) -> Self {
        Self {
            channel,
            config,
            batch: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn prefetch_count(&self) -> u16 {
        self.config.prefetch_count
    }

    pub fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.is_open()
    }

    pub fn stage(&self, outgoing: OutgoingMessage) -> Result<()> {
        let mut batch = self.lock_batch()?;
        batch.push(outgoing);
        Ok(())
    }

    pub fn staged(&self) -> usize {
        self.lock_batch().map(|batch| batch.len()).unwrap_or(0)
    }

    /// Sends every staged publish. Returns how many were sent; zero means nothing was staged.
    pub async fn flush(&self) -> Result<usize> {
        let batch = std::mem::take(&mut *self.lock_batch()?);
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        self.channel.publish_batch(batch).await?;
        debug!(channel_id = %self.config.id, count, "Flushed publish batch");
        Ok(count)
    }

    /// Closes the channel once; later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let dropped = self.lock_batch().map(|mut batch| std::mem::take(&mut *batch).len()).unwrap_or(0);
        if dropped > 0 {
            warn!(channel_id = %self.config.id, dropped, "Closing channel with unsent batched messages");
        }

        debug!(channel_id = %self.config.id, "Closing channel");
        self.channel.close().await
    }

    fn lock_batch(&self) -> Result<std::sync::MutexGuard<'_, Vec<OutgoingMessage>>> {
        self.batch
            .lock()
            .map_err(|_| RabbitMQError::ChannelError("Channel batch lock poisoned".to_string()))
    }
}
