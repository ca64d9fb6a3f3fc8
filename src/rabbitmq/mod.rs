// src/rabbitmq/mod.rs
// Broker access: transport seam, client, consumer loop and RPC engine

pub mod errors;
pub mod transport;
pub mod lapin_transport;
pub mod memory;

pub mod connection;
pub mod channel_manager;
pub mod publisher;
pub mod amqp_client;
pub mod consumer;
pub mod request_response;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpClient;
pub use channel_manager::{ChannelConfig, ChannelManager};
pub use connection::ConnectionManager;
pub use consumer::{AckDecision, ConsumerLoop, ExitReason, FailureReport, LoopReport, MessageConsumer};
pub use errors::{RabbitMQError, Result};
pub use publisher::{Payload, PublishMode};
pub use request_response::{ResponseMap, RpcClient};
