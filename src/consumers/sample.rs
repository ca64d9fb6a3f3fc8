// src/consumers/sample.rs

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::message::{Delivery, MessageProperties};
use crate::rabbitmq::amqp_client::AmqpClient;
use crate::rabbitmq::consumer::{AckDecision, MessageConsumer};
use crate::rabbitmq::publisher::PublishMode;

pub const SAMPLE_EXCHANGE: &str = "consume-me";

/// Prints each body to stdout and, when the message asks for a reply, echoes the
/// decoded JSON back to its reply queue under the same correlation id.
pub struct SampleConsumer {
    client: Arc<AmqpClient>,
    error_exchange: Option<String>,
}

impl SampleConsumer {
    pub fn new(client: Arc<AmqpClient>) -> Self {
        Self {
            client,
            error_exchange: None,
        }
    }

    pub fn with_error_exchange(mut self, error_exchange: Option<String>) -> Self {
        self.error_exchange = error_exchange;
        self
    }
}

#[async_trait]
impl MessageConsumer for SampleConsumer {
    fn exchange_id(&self) -> &str {
        SAMPLE_EXCHANGE
    }

    fn error_exchange_id(&self) -> Option<&str> {
        self.error_exchange.as_deref()
    }

    async fn on_message(&self, delivery: &Delivery) -> anyhow::Result<AckDecision> {
        let message = &delivery.message;
        println!("{}", message.body_lossy());

        if let Some(reply_to) = message.reply_to() {
            let payload = message.json().context("reply requested for a non-JSON body")?;
            let mut properties = MessageProperties::new();
            properties.correlation_id = message.properties.correlation_id.clone();

            self.client
                .publish(reply_to, payload, properties, PublishMode::ReplyCallback, None)
                .await
                .context("failed to publish reply")?;
            info!(reply_to, correlation_id = ?message.correlation_id(), "Sent reply");
        }

        Ok(AckDecision::Ack)
    }
}
