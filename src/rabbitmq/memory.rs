// src/rabbitmq/memory.rs
//! In-process broker implementing the transport traits.
//!
//! It follows the AMQP 0-9-1 behaviour the core relies on: durable/exclusive/
//! auto-delete queues, direct routing (including the default exchange), per-channel
//! prefetch, ack/reject with requeue to the head of the queue, consumer cancellation,
//! and requeue of unacknowledged deliveries when a channel closes. Delays on
//! `x-delayed-message` exchanges are not simulated; messages route immediately.
//!
//! Every broker-side action is appended to an event log so tests can assert on
//! ordering and on how each delivery was settled.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::trace;

use super::errors::{RabbitMQError, Result};
use super::publisher::OutgoingMessage;
use super::transport::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeType, QueueOptions,
};
use crate::config::BrokerConfig;
use crate::message::{Delivery, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionOpened { connection: u32 },
    ConnectionClosed { connection: u32 },
    ChannelOpened { channel: u16 },
    ChannelClosed { channel: u16 },
    ExchangeDeclared { name: String, kind: ExchangeType },
    QueueDeclared { name: String, options: QueueOptions },
    QueueDeleted { name: String },
    QueueBound { queue: String, exchange: String, routing_key: String },
    Qos { channel: u16, prefetch_count: u16 },
    Published { exchange: String, routing_key: String, message: Message },
    ConsumerStarted { queue: String, consumer_tag: String },
    ConsumerCancelled { consumer_tag: String },
    Acked { delivery_tag: u64 },
    Rejected { delivery_tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
struct Ready {
    exchange: String,
    routing_key: String,
    message: Message,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel: u16,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u32>,
    ready: VecDeque<Ready>,
    consumers: Vec<ConsumerEntry>,
    had_consumer: bool,
}

struct Unacked {
    queue: String,
    ready: Ready,
}

struct ChannelState {
    connection: u32,
    open: bool,
    prefetch: u16,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.open && (self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failures_remaining: u32,
    settle_failures_remaining: u32,
    credentials: Option<(String, String)>,
    connections_opened: usize,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u16, ChannelState>,
    next_connection: u32,
    next_channel: u16,
    next_delivery_tag: u64,
    events: Vec<BrokerEvent>,
}

impl BrokerState {
    fn record(&mut self, event: BrokerEvent) {
        trace!(?event, "memory broker");
        self.events.push(event);
    }

    // Leaves the delivery unacked, as a broker dropping the frame would.
    fn refuse_settle(&mut self) -> Result<()> {
        if self.settle_failures_remaining == 0 {
            return Ok(());
        }
        self.settle_failures_remaining -= 1;
        Err(RabbitMQError::ChannelError(
            "CHANNEL_ERROR - settlement refused".to_string(),
        ))
    }

    fn open_channel(&self, channel: u16) -> Result<()> {
        match self.channels.get(&channel) {
            Some(state) if state.open => Ok(()),
            _ => Err(RabbitMQError::ChannelError(format!("channel {} is closed", channel))),
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.record(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let kind = self.exchanges.get(exchange).ok_or_else(|| {
                RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let fanout = matches!(kind, ExchangeType::Delayed { delayed_type } if delayed_type == "fanout");
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && (fanout || b.routing_key == routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };

        for queue_name in targets {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_back(Ready {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    redelivered: false,
                });
                self.dispatch(&queue_name);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            channels,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            queue.consumers.retain(|consumer| !consumer.sender.is_closed());
            let slot = queue.consumers.iter().position(|consumer| {
                channels
                    .get(&consumer.channel)
                    .is_some_and(ChannelState::has_capacity)
            });
            let Some(index) = slot else {
                break;
            };

            let consumer = queue.consumers.remove(index);
            let Some(ready) = queue.ready.pop_front() else {
                queue.consumers.insert(index, consumer);
                break;
            };

            *next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: *next_delivery_tag,
                redelivered: ready.redelivered,
                exchange: ready.exchange.clone(),
                routing_key: ready.routing_key.clone(),
                message: ready.message.clone(),
            };

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(ready);
                continue;
            }

            if let Some(channel) = channels.get_mut(&consumer.channel) {
                channel.unacked.insert(
                    *next_delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        ready,
                    },
                );
            }
            // Round-robin between consumers of the same queue.
            queue.consumers.push(consumer);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(Ready {
                redelivered: true,
                ..unacked.ready
            });
        }
    }

    fn remove_consumers<F>(&mut self, predicate: F) -> Vec<String>
    where
        F: Fn(&ConsumerEntry) -> bool,
    {
        let mut removed = Vec::new();
        let mut emptied = Vec::new();

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                if predicate(consumer) {
                    removed.push(consumer.tag.clone());
                    false
                } else {
                    true
                }
            });
            if before != queue.consumers.len()
                && queue.consumers.is_empty()
                && queue.options.auto_delete
                && queue.had_consumer
            {
                emptied.push(name.clone());
            }
        }

        for tag in &removed {
            self.record(BrokerEvent::ConsumerCancelled {
                consumer_tag: tag.clone(),
            });
        }
        for name in emptied {
            self.delete_queue(&name);
        }
        removed
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            self.bindings.retain(|binding| binding.queue != name);
            self.record(BrokerEvent::QueueDeleted {
                name: name.to_string(),
            });
        }
    }

    fn close_channel(&mut self, channel: u16) {
        let unacked = match self.channels.get_mut(&channel) {
            Some(state) if state.open => {
                state.open = false;
                std::mem::take(&mut state.unacked)
            }
            _ => return,
        };

        // Highest tag first so the oldest delivery ends up at the head again.
        for (_, entry) in unacked.into_iter().rev() {
            self.requeue(entry);
        }
        self.remove_consumers(|consumer| consumer.channel == channel);
        self.record(BrokerEvent::ChannelClosed { channel });
        self.dispatch_all();
    }
}

/// Shared handle to one in-process broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections presenting these credentials.
    pub fn with_credentials(self, user: &str, password: &str) -> Self {
        self.lock().credentials = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Fail the next `count` ack/reject calls.
    pub fn fail_next_settles(&self, count: u32) {
        self.lock().settle_failures_remaining = count;
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    /// Messages published to `exchange` through any channel or [`MemoryBroker::publish`].
    pub fn published_to(&self, exchange: &str) -> Vec<Message> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Published {
                    exchange: target,
                    message,
                    ..
                } if target == exchange => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages sent straight to `queue` through the default exchange.
    pub fn sent_to_queue(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Published {
                    exchange,
                    routing_key,
                    message,
                } if exchange.is_empty() && routing_key == queue => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn exchange_type(&self, name: &str) -> Option<ExchangeType> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Messages ready for delivery (not counting unacknowledged ones).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Publishes as an outside producer would, without a client channel.
    pub fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        self.lock().route(exchange, routing_key, &message)
    }

    /// Server-initiated cancel of every consumer on `queue`.
    pub fn cancel_consumers(&self, queue: &str) -> Vec<String> {
        let mut state = self.lock();
        let Some(tags) = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect::<Vec<_>>())
        else {
            return Vec::new();
        };
        state.remove_consumers(|consumer| tags.contains(&consumer.tag))
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.broker.lock();

        if state.unreachable {
            return Err(RabbitMQError::ConnectionError(format!(
                "connection refused: {}",
                config.redacted_uri()
            )));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(RabbitMQError::ConnectionError(format!(
                "connection reset: {}",
                config.redacted_uri()
            )));
        }
        if let Some((user, password)) = &state.credentials {
            if user != &config.user || password != &config.password {
                return Err(RabbitMQError::ConnectionError(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    config.user
                )));
            }
        }

        state.next_connection += 1;
        state.connections_opened += 1;
        let id = state.next_connection;
        state.record(BrokerEvent::ConnectionOpened { connection: id });

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            open: AtomicBool::new(true),
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u32,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(RabbitMQError::ConnectionError(format!(
                "connection {} is closed",
                self.id
            )));
        }

        let mut state = self.broker.lock();
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                unacked: BTreeMap::new(),
            },
        );
        state.record(BrokerEvent::ChannelOpened { channel: id });

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.lock();
        let channels: Vec<u16> = state
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            state.close_channel(channel);
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.delete_queue(&name);
        }

        state.record(BrokerEvent::ConnectionClosed { connection: self.id });
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u16,
    connection: u32,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker.lock().open_channel(self.id).is_ok()
    }

    async fn exchange_declare(&self, name: &str, kind: &ExchangeType) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        if name.is_empty() || name.starts_with("amq.") {
            return Err(RabbitMQError::ChannelError(format!(
                "ACCESS_REFUSED - exchange name '{}' is reserved",
                name
            )));
        }
        match state.exchanges.get(name) {
            Some(existing) if existing != kind => {
                return Err(RabbitMQError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    name,
                    kind.kind_name(),
                    existing.kind_name()
                )));
            }
            Some(_) => {}
            None => {
                state.exchanges.insert(name.to_string(), kind.clone());
            }
        }

        state.record(BrokerEvent::ExchangeDeclared {
            name: name.to_string(),
            kind: kind.clone(),
        });
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        match state.queues.get(name) {
            Some(existing) if existing.owner.is_some_and(|owner| owner != self.connection) => {
                return Err(RabbitMQError::ChannelError(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                    name
                )));
            }
            Some(existing) if existing.options != options => {
                return Err(RabbitMQError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    name
                )));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        owner: options.exclusive.then_some(self.connection),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        had_consumer: false,
                    },
                );
            }
        }

        state.record(BrokerEvent::QueueDeclared {
            name: name.to_string(),
            options,
        });
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        state.record(BrokerEvent::QueueBound {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        state.record(BrokerEvent::Qos {
            channel: self.id,
            prefetch_count,
        });
        state.dispatch_all();
        Ok(())
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.route(exchange, routing_key, message)
    }

    async fn publish_batch(&self, batch: Vec<OutgoingMessage>) -> Result<()> {
        // One lock for the whole batch: nothing is delivered until all of it is routed.
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        for outgoing in &batch {
            state.route(&outgoing.exchange, &outgoing.routing_key, &outgoing.message)?;
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        let (sender, receiver) = mpsc::unbounded();
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", uuid::Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)));
        };
        queue_state.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel: self.id,
            sender,
        });
        queue_state.had_consumer = true;

        state.record(BrokerEvent::ConsumerStarted {
            queue: queue.to_string(),
            consumer_tag: tag,
        });
        state.dispatch(queue);
        Ok(receiver.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let channel = self.id;
        state.remove_consumers(|consumer| consumer.channel == channel && consumer.tag == consumer_tag);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.refuse_settle()?;

        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        if removed.is_none() {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        }

        state.record(BrokerEvent::Acked { delivery_tag });
        state.dispatch_all();
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.refuse_settle()?;

        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        let Some(entry) = removed else {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        };

        if requeue {
            state.requeue(entry);
        }
        state.record(BrokerEvent::Rejected {
            delivery_tag,
            requeue,
        });
        state.dispatch_all();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}
