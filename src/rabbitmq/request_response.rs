// src/rabbitmq/request_response.rs
//! Blocking request/response over the broker.
//!
//! Requests are staged as a batch on a dedicated channel, each stamped with a fresh
//! correlation id and the engine's private reply queue. Awaiting arms the reply
//! consumer first, then flushes the batch, then pumps replies until every pending id
//! has an answer. Replies for ids the engine is not waiting on are requeued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::AmqpClient;
use super::channel_manager::{ChannelConfig, ChannelManager};
use super::errors::{RabbitMQError, Result};
use super::publisher::{Payload, PublishMode};
use super::transport::{BrokerChannel, DeliveryStream, QueueOptions};
use crate::message::MessageProperties;

/// Raw reply bodies keyed by correlation id.
pub type ResponseMap = HashMap<String, Vec<u8>>;

const REPLY_QUEUE_PREFIX: &str = "rpc__";
const CORRELATION_PREFIX: &str = "response__";

pub struct RpcClient {
    client: Arc<AmqpClient>,
    reply_queue: String,
    channel: Option<ChannelManager>,
    replies: Option<(String, DeliveryStream)>,
    pending: Vec<String>,
    received: ResponseMap,
}

impl RpcClient {
    pub fn new(client: Arc<AmqpClient>) -> Self {
        Self {
            client,
            reply_queue: format!("{}{}", REPLY_QUEUE_PREFIX, Uuid::new_v4().simple()),
            channel: None,
            replies: None,
            pending: Vec::new(),
            received: ResponseMap::new(),
        }
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Correlation ids issued and not yet answered, in request order.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    // Dedicated channel without a prefetch limit: a requeued stale reply must never
    // be the only delivery the broker is willing to hand out.
    async fn setup(&mut self) -> Result<ChannelManager> {
        if let Some(channel) = self.channel.as_ref().filter(|channel| channel.is_healthy()) {
            return Ok(channel.clone());
        }

        let channel = self
            .client
            .open_channel(ChannelConfig::named(format!("rpc-{}", self.reply_queue)).with_prefetch(0))
            .await?;
        channel
            .channel()
            .queue_declare(&self.reply_queue, QueueOptions::private())
            .await?;
        info!(reply_queue = %self.reply_queue, "Declared RPC reply queue");

        self.replies = None;
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Stages one request and returns its correlation id. Nothing is sent until
    /// [`RpcClient::get_responses`].
    pub async fn request(
        &mut self,
        exchange: &str,
        payload: impl Into<Payload>,
        properties: MessageProperties,
    ) -> Result<String> {
        let channel = self.setup().await?;
        let correlation_id = format!("{}{}", CORRELATION_PREFIX, Uuid::new_v4().simple());

        let (payload, properties) = match payload.into() {
            Payload::Message(mut message) => {
                if !properties.is_empty() {
                    return Err(RabbitMQError::InvalidArgument(
                        "properties must be empty when requesting with a prebuilt message".to_string(),
                    ));
                }
                message.properties.correlation_id = Some(correlation_id.clone());
                message.properties.reply_to = Some(self.reply_queue.clone());
                (Payload::Message(message), MessageProperties::default())
            }
            json => (
                json,
                properties
                    .with_correlation_id(correlation_id.clone())
                    .with_reply_to(self.reply_queue.clone()),
            ),
        };

        self.client
            .publish(exchange, payload, properties, PublishMode::Batch, Some(&channel))
            .await?;
        self.pending.push(correlation_id.clone());
        debug!(exchange, correlation_id = %correlation_id, pending = self.pending.len(), "Staged RPC request");
        Ok(correlation_id)
    }

    /// Sends the staged requests and waits, without a deadline, for every reply.
    pub async fn get_responses(&mut self) -> Result<ResponseMap> {
        self.await_responses(None).await
    }

    /// Like [`RpcClient::get_responses`] but fails with
    /// [`RabbitMQError::ProtocolTimeout`] after `deadline`. The pending ids stay
    /// pending, so the call can be retried.
    pub async fn get_responses_within(&mut self, deadline: Duration) -> Result<ResponseMap> {
        self.await_responses(Some(deadline)).await
    }

    async fn await_responses(&mut self, deadline: Option<Duration>) -> Result<ResponseMap> {
        if self.pending.is_empty() {
            return Ok(ResponseMap::new());
        }

        let channel = self.setup().await?;

        // The consumer must be armed before the batch goes out.
        if self.replies.is_none() {
            let consumer_tag = format!("rpc-ctag-{}", Uuid::new_v4().simple());
            let stream = channel
                .channel()
                .basic_consume(&self.reply_queue, &consumer_tag)
                .await?;
            debug!(reply_queue = %self.reply_queue, consumer_tag = %consumer_tag, "Armed reply consumer");
            self.replies = Some((consumer_tag, stream));
        }

        let sent = channel.flush().await?;
        debug!(sent, pending = self.pending.len(), "Flushed RPC batch, awaiting replies");

        let Some((_, replies)) = self.replies.as_mut() else {
            return Err(RabbitMQError::ConsumeError("reply consumer is not armed".to_string()));
        };
        let collect = collect_responses(channel.channel(), replies, &self.pending, &mut self.received);

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, collect).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(?deadline, pending = self.pending.len(), "Timed out waiting for RPC replies");
                    return Err(RabbitMQError::ProtocolTimeout(deadline));
                }
            },
            None => collect.await,
        };

        if let Err(err) = outcome {
            // Stream is gone; the next await arms a new consumer.
            self.replies = None;
            return Err(err);
        }

        self.pending.clear();
        Ok(std::mem::take(&mut self.received))
    }

    /// One request, awaited on its own. Any batch already pending is set aside
    /// for the duration of the call and restored afterwards, even on error.
    pub async fn direct_request(
        &mut self,
        exchange: &str,
        payload: impl Into<Payload>,
        properties: MessageProperties,
    ) -> Result<Vec<u8>> {
        self.isolated_request(exchange, payload.into(), properties, None).await
    }

    pub async fn direct_request_within(
        &mut self,
        exchange: &str,
        payload: impl Into<Payload>,
        properties: MessageProperties,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        self.isolated_request(exchange, payload.into(), properties, Some(deadline))
            .await
    }

    async fn isolated_request(
        &mut self,
        exchange: &str,
        payload: Payload,
        properties: MessageProperties,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let saved_pending = std::mem::take(&mut self.pending);
        let saved_received = std::mem::take(&mut self.received);

        let result = self.single_request(exchange, payload, properties, deadline).await;

        self.pending = saved_pending;
        self.received = saved_received;
        result
    }

    async fn single_request(
        &mut self,
        exchange: &str,
        payload: Payload,
        properties: MessageProperties,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let correlation_id = self.request(exchange, payload, properties).await?;
        let mut responses = self.await_responses(deadline).await?;
        responses.remove(&correlation_id).ok_or_else(|| {
            RabbitMQError::ConsumeError(format!("no reply recorded for {}", correlation_id))
        })
    }

    /// Cancels the reply consumer, requeues anything it still buffers, and closes
    /// the engine's channel.
    pub async fn close(&mut self) -> Result<()> {
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        if let Some((consumer_tag, mut replies)) = self.replies.take() {
            if let Err(err) = channel.channel().basic_cancel(&consumer_tag).await {
                warn!(consumer_tag = %consumer_tag, "Failed to cancel reply consumer: {}", err);
            }
            while let Some(Some(Ok(delivery))) = replies.next().now_or_never() {
                if let Err(err) = channel.channel().basic_reject(delivery.delivery_tag, true).await {
                    warn!(delivery_tag = delivery.delivery_tag, "Failed to requeue reply: {}", err);
                }
            }
        }

        self.pending.clear();
        self.received.clear();
        channel.close().await
    }
}

async fn collect_responses(
    channel: &Arc<dyn BrokerChannel>,
    replies: &mut DeliveryStream,
    pending: &[String],
    received: &mut ResponseMap,
) -> Result<()> {
    while !pending.iter().all(|id| received.contains_key(id)) {
        let delivery = match replies.next().await {
            Some(delivery) => delivery?,
            None => {
                return Err(RabbitMQError::ConsumeError(
                    "reply consumer was cancelled".to_string(),
                ))
            }
        };

        match delivery.message.correlation_id() {
            Some(id) if pending.iter().any(|pending_id| pending_id == id) => {
                received.insert(id.to_string(), delivery.message.body.clone());
                channel.basic_ack(delivery.delivery_tag).await?;
                debug!(correlation_id = id, received = received.len(), "Recorded RPC reply");
            }
            other => {
                debug!(correlation_id = ?other, "Requeueing reply for an id not pending here");
                channel.basic_reject(delivery.delivery_tag, true).await?;
                tokio::task::yield_now().await;
            }
        }
    }
    Ok(())
}
