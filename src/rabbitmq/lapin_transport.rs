// src/rabbitmq/lapin_transport.rs
//! The transport traits on top of lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, warn};

use super::errors::{RabbitMQError, Result};
use super::publisher::OutgoingMessage;
use super::transport::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeType, QueueOptions,
};
use crate::config::BrokerConfig;
use crate::message::{Delivery, HeaderValue, Message, MessageProperties};

const CONNECTION_NAME: &str = "rabbitmq-bridge";

#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>> {
        info!("Attempting to connect to RabbitMQ at {}", config.redacted_uri());

        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(CONNECTION_NAME.to_string()));
        let connection = tokio::time::timeout(
            config.connect_timeout(),
            Connection::connect(&config.uri(), properties),
        )
        .await??;

        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        info!("Closing RabbitMQ connection gracefully");
        self.connection.close(200, "Closing connection").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, name: &str, kind: &ExchangeType) -> Result<()> {
        let mut arguments = FieldTable::default();
        let exchange_kind = match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Delayed { delayed_type } => {
                arguments.insert(
                    ShortString::from("x-delayed-type"),
                    AMQPValue::LongString(LongString::from(delayed_type.clone())),
                );
                ExchangeKind::Custom(kind.kind_name().to_string())
            }
        };

        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, exchange_kind, options, arguments)
            .await?;
        debug!(exchange = name, kind = kind.kind_name(), "Exchange declared");
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<()> {
        let declare_options = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(name, declare_options, FieldTable::default())
            .await?;
        debug!(queue = name, messages = queue.message_count(), "Queue declared");
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn publish_batch(&self, batch: Vec<OutgoingMessage>) -> Result<()> {
        // Send every frame first, then wait on all the confirms together.
        let mut confirms = Vec::with_capacity(batch.len());
        for outgoing in &batch {
            let confirm = self
                .channel
                .basic_publish(
                    &outgoing.exchange,
                    &outgoing.routing_key,
                    BasicPublishOptions::default(),
                    &outgoing.message.body,
                    to_basic_properties(&outgoing.message.properties),
                )
                .await?;
            confirms.push(confirm);
        }
        try_join_all(confirms).await?;
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(from_lapin_delivery).map_err(RabbitMQError::from))
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel.close(200, "OK").await?;
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &properties.headers {
            let value = match value {
                HeaderValue::Str(text) => AMQPValue::LongString(LongString::from(text.clone())),
                HeaderValue::Int(number) => AMQPValue::LongLongInt(*number),
                HeaderValue::Bool(flag) => AMQPValue::Boolean(*flag),
            };
            headers.insert(ShortString::from(name.clone()), value);
        }
        basic = basic.with_headers(headers);
    }

    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    let mut properties = MessageProperties {
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        content_type: text(basic.content_type()),
        message_id: text(basic.message_id()),
        delivery_mode: *basic.delivery_mode(),
        ..MessageProperties::default()
    };

    if let Some(headers) = basic.headers() {
        for (name, value) in headers.inner() {
            let converted = match value {
                AMQPValue::LongString(text) => {
                    HeaderValue::Str(String::from_utf8_lossy(text.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(text) => HeaderValue::Str(text.as_str().to_string()),
                AMQPValue::LongLongInt(number) => HeaderValue::Int(*number),
                AMQPValue::LongInt(number) => HeaderValue::Int(i64::from(*number)),
                AMQPValue::ShortInt(number) => HeaderValue::Int(i64::from(*number)),
                AMQPValue::ShortShortInt(number) => HeaderValue::Int(i64::from(*number)),
                AMQPValue::LongUInt(number) => HeaderValue::Int(i64::from(*number)),
                AMQPValue::ShortUInt(number) => HeaderValue::Int(i64::from(*number)),
                AMQPValue::ShortShortUInt(number) => HeaderValue::Int(i64::from(*number)),
                AMQPValue::Boolean(flag) => HeaderValue::Bool(*flag),
                other => {
                    warn!(header = name.as_str(), value = ?other, "Skipping unsupported header value");
                    continue;
                }
            };
            properties.headers.insert(name.as_str().to_string(), converted);
        }
    }

    properties
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        message: Message::new(delivery.data, from_basic_properties(&delivery.properties)),
    }
}
