// src/rabbitmq/consumer.rs
//! Consumer loop: bind, consume one delivery at a time, settle each delivery
//! exactly once, and always release the channel and connection on exit.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::AmqpClient;
use super::channel_manager::{ChannelConfig, ChannelManager};
use super::errors::{RabbitMQError, Result};
use super::publisher::{Payload, PublishMode};
use super::transport::BrokerChannel;
use crate::message::{Delivery, Message, MessageProperties};

/// What to do with a delivery once its handler returns.
///
/// Integer codes follow a low-bit rule: odd acknowledges, zero rejects,
/// any other even value rejects with requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject,
    Requeue,
}

impl AckDecision {
    pub fn from_code(code: i64) -> Self {
        if code & 1 == 1 {
            AckDecision::Ack
        } else if code == 0 {
            AckDecision::Reject
        } else {
            AckDecision::Requeue
        }
    }
}

impl From<i64> for AckDecision {
    fn from(code: i64) -> Self {
        AckDecision::from_code(code)
    }
}

impl From<bool> for AckDecision {
    fn from(ack: bool) -> Self {
        if ack {
            AckDecision::Ack
        } else {
            AckDecision::Reject
        }
    }
}

impl From<()> for AckDecision {
    fn from(_: ()) -> Self {
        AckDecision::Ack
    }
}

// An unset result acknowledges.
impl<T: Into<AckDecision>> From<Option<T>> for AckDecision {
    fn from(value: Option<T>) -> Self {
        value.map_or(AckDecision::Ack, Into::into)
    }
}

/// A consumer bound to one exchange.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Exchange to consume from; the queue of the same name is bound to it.
    fn exchange_id(&self) -> &str;

    /// Where failure reports go. `None` disables reporting.
    fn error_exchange_id(&self) -> Option<&str> {
        None
    }

    fn handler_id(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handles one delivery. An `Err` rejects the delivery without requeue.
    async fn on_message(&self, delivery: &Delivery) -> anyhow::Result<AckDecision>;
}

/// Published to the error exchange when a handler fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub handler: String,
    pub error: String,
    pub message: Value,
    pub failed_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(handler: &str, error: &RabbitMQError, message: &Message) -> Self {
        Self {
            handler: handler.to_string(),
            error: error.to_string(),
            message: message
                .json()
                .unwrap_or_else(|_| Value::String(message.body_lossy())),
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Bound,
    Consuming,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ProcessLimit,
    ConsumerCancelled,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub processed: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    /// Handler errors; these deliveries were rejected without requeue.
    pub failed: u64,
    pub exit: ExitReason,
}

#[derive(Default)]
struct Tally {
    processed: u64,
    acked: u64,
    rejected: u64,
    requeued: u64,
    failed: u64,
}

impl Tally {
    fn finish(self, exit: ExitReason) -> LoopReport {
        LoopReport {
            processed: self.processed,
            acked: self.acked,
            rejected: self.rejected,
            requeued: self.requeued,
            failed: self.failed,
            exit,
        }
    }
}

pub struct ConsumerLoop<C> {
    client: Arc<AmqpClient>,
    consumer: C,
    process_limit: Option<u64>,
    // Mutex keeps the loop Sync while the signal itself is only Send.
    shutdown: Mutex<Option<BoxFuture<'static, ()>>>,
    state: ConsumerState,
}

impl<C: MessageConsumer> ConsumerLoop<C> {
    pub fn new(client: Arc<AmqpClient>, consumer: C) -> Self {
        Self {
            client,
            consumer,
            process_limit: None,
            shutdown: Mutex::new(None),
            state: ConsumerState::Idle,
        }
    }

    /// Stop after `limit` deliveries. `None` or zero means unlimited.
    pub fn with_process_limit(mut self, limit: Option<u64>) -> Self {
        self.process_limit = limit.filter(|limit| *limit > 0);
        self
    }

    /// Stop when `signal` resolves. Only observed between deliveries.
    pub fn with_shutdown<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Mutex::new(Some(signal.boxed()));
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Runs until the process limit, cancellation, or shutdown. The channel and
    /// the client connection are closed on every exit path, errors included.
    pub async fn run(&mut self) -> Result<LoopReport> {
        if self.state != ConsumerState::Idle {
            return Err(RabbitMQError::ConsumeError(
                "consumer loop has already run".to_string(),
            ));
        }

        let mut channel = None;
        let outcome = self.consume(&mut channel).await;

        self.state = ConsumerState::Draining;
        self.cleanup(channel).await;
        self.state = ConsumerState::Closed;

        match &outcome {
            Ok(report) => info!(
                exchange = self.consumer.exchange_id(),
                processed = report.processed,
                exit = ?report.exit,
                "Consumer loop finished"
            ),
            Err(err) => error!(exchange = self.consumer.exchange_id(), "Consumer loop failed: {}", err),
        }
        outcome
    }

    async fn consume(&mut self, slot: &mut Option<ChannelManager>) -> Result<LoopReport> {
        let exchange = self.consumer.exchange_id().to_string();
        let channel = self
            .client
            .open_channel(ChannelConfig::named(format!("consumer-{}", exchange)).with_prefetch(1))
            .await?;
        *slot = Some(channel.clone());
        let broker = channel.channel();

        broker.queue_bind(&exchange, &exchange, "").await?;
        self.state = ConsumerState::Bound;

        let consumer_tag = format!("ctag-{}", Uuid::new_v4().simple());
        let mut deliveries = broker.basic_consume(&exchange, &consumer_tag).await?;
        self.state = ConsumerState::Consuming;
        info!(exchange = %exchange, consumer_tag = %consumer_tag, "Started consuming");

        let mut shutdown = self
            .shutdown
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .unwrap_or_else(|| futures::future::pending::<()>().boxed());
        let mut tally = Tally::default();

        let exit = loop {
            if self.process_limit.is_some_and(|limit| tally.processed >= limit) {
                break ExitReason::ProcessLimit;
            }

            let next = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                next = deliveries.next() => Some(next),
            };

            let delivery = match next {
                None => break ExitReason::Shutdown,
                Some(None) => break ExitReason::ConsumerCancelled,
                Some(Some(Err(err))) => {
                    return Err(RabbitMQError::ConsumeError(format!(
                        "delivery stream failed: {}",
                        err
                    )))
                }
                Some(Some(Ok(delivery))) => delivery,
            };

            self.process(broker, delivery, &mut tally).await?;
        };

        Ok(tally.finish(exit))
    }

    async fn process(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        delivery: Delivery,
        tally: &mut Tally,
    ) -> Result<()> {
        tally.processed += 1;
        let tag = delivery.delivery_tag;

        match self.consumer.on_message(&delivery).await {
            Ok(decision) => {
                debug!(delivery_tag = tag, ?decision, "Handler finished");
                settle(channel, tag, decision).await?;
                match decision {
                    AckDecision::Ack => tally.acked += 1,
                    AckDecision::Reject => tally.rejected += 1,
                    AckDecision::Requeue => tally.requeued += 1,
                }
            }
            Err(err) => {
                let failure = RabbitMQError::HandlerError(format!("{:#}", err));
                warn!(
                    delivery_tag = tag,
                    handler = self.consumer.handler_id(),
                    "{}",
                    failure
                );
                tally.failed += 1;

                // Report first: a failed reject ends the loop.
                if let Some(error_exchange) = self.consumer.error_exchange_id() {
                    self.report_failure(error_exchange, &delivery.message, &failure).await;
                }
                settle(channel, tag, AckDecision::Reject).await?;
            }
        }
        Ok(())
    }

    // Best effort: a failed report must not hide the handler error.
    async fn report_failure(&self, error_exchange: &str, message: &Message, err: &RabbitMQError) {
        let report = FailureReport::new(self.consumer.handler_id(), err, message);
        let result = match Payload::json(&report) {
            Ok(payload) => {
                self.client
                    .publish(
                        error_exchange,
                        payload,
                        MessageProperties::default(),
                        PublishMode::Direct,
                        None,
                    )
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(publish_err) = result {
            warn!(error_exchange, "Failed to publish failure report: {}", publish_err);
        }
    }

    async fn cleanup(&self, channel: Option<ChannelManager>) {
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(channel_id = channel.id(), "Failed to close consumer channel: {}", err);
            }
        }
        if let Err(err) = self.client.close().await {
            warn!("Failed to close connection: {}", err);
        }
    }
}

async fn settle(channel: &Arc<dyn BrokerChannel>, delivery_tag: u64, decision: AckDecision) -> Result<()> {
    let result = match decision {
        AckDecision::Ack => channel.basic_ack(delivery_tag).await,
        AckDecision::Reject => channel.basic_reject(delivery_tag, false).await,
        AckDecision::Requeue => channel.basic_reject(delivery_tag, true).await,
    };

    result.map_err(|err| match err {
        RabbitMQError::AckError(_) | RabbitMQError::ConnectionError(_) => err,
        other => RabbitMQError::AckError(other.to_string()),
    })
}
