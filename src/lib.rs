// src/lib.rs
pub mod cli;
pub mod config;
pub mod consumers;
pub mod message;
pub mod rabbitmq;

pub use message::{Delivery, Message, MessageProperties};
pub use rabbitmq::{AmqpClient, RabbitMQError};
