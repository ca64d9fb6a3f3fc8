// src/rabbitmq/transport.rs
//! Broker seam: the handful of AMQP operations the core needs, behind object-safe
//! traits so the same client, consumer loop and RPC engine run against lapin in
//! production and against [`super::memory::MemoryBroker`] in tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::publisher::OutgoingMessage;
use crate::config::BrokerConfig;
use crate::message::{Delivery, Message};

/// Deliveries for one consumer tag; ends when the consumer is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Exchange flavours this crate declares. Both are durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    /// `x-delayed-message` exchange routing with `delayed_type` once the delay expires.
    Delayed { delayed_type: String },
}

impl ExchangeType {
    pub fn delayed() -> Self {
        ExchangeType::Delayed {
            delayed_type: "direct".to_string(),
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Delayed { .. } => "x-delayed-message",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Queue backing a durable exchange of the same name.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Private reply queue: gone with its connection.
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, name: &str, kind: &ExchangeType) -> Result<()>;

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn basic_publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()>;

    /// Sends a staged batch. Implementations should send it as one unit where the
    /// broker client allows; the default just publishes in order.
    async fn publish_batch(&self, batch: Vec<OutgoingMessage>) -> Result<()> {
        for outgoing in &batch {
            self.basic_publish(&outgoing.exchange, &outgoing.routing_key, &outgoing.message)
                .await?;
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
