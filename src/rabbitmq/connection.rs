// src/rabbitmq/connection.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info};

use super::errors::{RabbitMQError, Result};
use super::transport::{BrokerConnection, Connector};
use crate::config::BrokerConfig;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Opens the broker connection on first use and hands the same one out afterwards.
///
/// The memoized connection is returned as-is; there is no health check and no
/// automatic reconnection. [`ConnectionManager::close`] resets it so a later call
/// connects again.
pub struct ConnectionManager {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        // Held across the connect so concurrent callers share one connection.
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.establish_connection().await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn establish_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let max_attempts = self.config.connect_attempts.max(1);
        let mut delay = self.config.reconnect_delay_ms;
        let mut attempts = 0;

        loop {
            match self.connector.connect(&self.config).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, max_attempts, err
                    );

                    if attempts >= max_attempts {
                        return Err(match err {
                            RabbitMQError::TimeoutError(_) | RabbitMQError::ConnectionError(_) => err,
                            other => RabbitMQError::ConnectionError(other.to_string()),
                        });
                    }

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next connect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Closes and forgets the memoized connection, if any.
    pub async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }
}
