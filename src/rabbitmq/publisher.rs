// src/rabbitmq/publisher.rs

use serde::Serialize;
use serde_json::Value;

use super::errors::{RabbitMQError, Result};
use crate::message::{Message, MessageProperties};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// How a publish is routed and when it leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Publish now to the named exchange with the empty routing key.
    Direct,
    /// Stage on the channel; nothing is sent until the batch is flushed.
    Batch,
    /// Publish now through the default exchange, using the target name as the
    /// routing key so the message lands in that queue. Used for RPC replies.
    ReplyCallback,
}

/// Publish input: application data to encode as JSON, or a message built by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Message(Message),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Builds the wire message. Properties belong either to a prebuilt message or to
    /// the call, never both.
    pub fn into_message(self, properties: MessageProperties) -> Result<Message> {
        match self {
            Payload::Message(message) => {
                if !properties.is_empty() {
                    return Err(RabbitMQError::InvalidArgument(
                        "properties must be empty when publishing a prebuilt message".to_string(),
                    ));
                }
                Ok(message)
            }
            Payload::Json(value) => {
                let mut properties = properties;
                if properties.content_type.is_none() {
                    properties.content_type = Some(JSON_CONTENT_TYPE.to_string());
                }
                Ok(Message::new(serde_json::to_vec(&value)?, properties))
            }
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Message> for Payload {
    fn from(message: Message) -> Self {
        Payload::Message(message)
    }
}

/// A publish staged in a channel's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

impl OutgoingMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, message: Message) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message,
        }
    }
}

/// Exchange and routing key for a publish to `target` in `mode`.
pub fn route(target: &str, mode: PublishMode) -> (&str, &str) {
    match mode {
        PublishMode::Direct | PublishMode::Batch => (target, ""),
        PublishMode::ReplyCallback => ("", target),
    }
}
