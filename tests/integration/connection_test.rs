use std::path::Path;
use std::sync::Arc;

use rabbitmq_bridge::config::{read_config_file, AppConfig, BrokerConfig};
use rabbitmq_bridge::message::MessageProperties;
use rabbitmq_bridge::rabbitmq::{AmqpClient, PublishMode};
use serde_json::json;

fn load_test_config() -> AppConfig {
    read_config_file(Path::new("tests/fixtures/test_config.json")).expect("Failed to read test config file")
}

#[test]
fn test_fixture_config_parses() {
    let config = load_test_config();
    assert_eq!(config.broker.connection_timeout_ms, 3000);
    assert_eq!(config.broker.heartbeat_seconds, 30);
    assert_eq!(config.consumer.process_limit, Some(5));
    assert_eq!(config.consumer.error_exchange.as_deref(), Some("bridge-errors"));
}

#[tokio::test]
async fn test_closed_port_is_connection_level_error() {
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        connection_timeout_ms: 1000,
        ..BrokerConfig::default()
    };
    let client = AmqpClient::new(config);

    let err = client.connect().await.err().expect("nothing listens on port 1");
    assert!(err.is_connection_level(), "unexpected error: {}", err);
    assert!(!client.is_connected().await);
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_live_broker_round_trip() {
    let config = load_test_config();
    let client = Arc::new(AmqpClient::new(config.broker));

    client.connect().await.unwrap();
    client.declare_exchange("bridge-smoke-test", false).await.unwrap();
    client.declare_exchange("bridge-smoke-test", false).await.unwrap();
    client
        .publish(
            "bridge-smoke-test",
            json!({"x": 1}),
            MessageProperties::default(),
            PublishMode::Batch,
            None,
        )
        .await
        .unwrap();
    assert_eq!(client.flush_batch(None).await.unwrap(), 1);

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(!client.is_connected().await);
}
