// src/rabbitmq/errors.rs

use std::time::Duration;

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message handler failed: {0}")]
    HandlerError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("No reply received within {0:?}")]
    ProtocolTimeout(Duration),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for failures that invalidate the whole connection rather than one call.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_) | RabbitMQError::TimeoutError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                RabbitMQError::ConnectionError(error_text)
            }
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    RabbitMQError::TopologyError(error_text)
                }
                AMQPErrorKind::Hard(_) => RabbitMQError::ConnectionError(error_text),
                _ => RabbitMQError::ChannelError(error_text),
            },
            _ => RabbitMQError::ChannelError(error_text),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}
