use std::collections::HashSet;
use std::time::Duration;

use rabbitmq_bridge::consumers::sample::{SampleConsumer, SAMPLE_EXCHANGE};
use rabbitmq_bridge::message::{Message, MessageProperties};
use rabbitmq_bridge::rabbitmq::memory::{BrokerEvent, MemoryBroker};
use rabbitmq_bridge::rabbitmq::{ConsumerLoop, ExitReason, RabbitMQError, RpcClient};
use serde_json::{json, Value};

use crate::support::{client, reverse_echo_responder};

async fn broker_with(exchange: &str) -> MemoryBroker {
    let broker = MemoryBroker::new();
    let setup = client(&broker);
    setup.declare_exchange(exchange, false).await.unwrap();
    setup.close().await.unwrap();
    broker
}

#[tokio::test]
async fn test_batch_responses_matched_regardless_of_order() {
    let broker = broker_with("svc").await;
    let mut rpc = RpcClient::new(client(&broker));

    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(rpc.request("svc", json!({"n": n}), MessageProperties::default()).await.unwrap());
    }
    let responder = tokio::spawn(reverse_echo_responder(broker.clone(), "svc".to_string(), 4));

    let responses = rpc.get_responses().await.unwrap();
    responder.await.unwrap();

    assert_eq!(responses.len(), 4);
    for (n, id) in ids.iter().enumerate() {
        let body: Value = serde_json::from_slice(&responses[id]).unwrap();
        assert_eq!(body, json!({"n": n}));
    }
    assert!(rpc.pending().is_empty());
}

#[tokio::test]
async fn test_stale_reply_is_requeued_and_left_out() {
    let broker = broker_with("svc").await;
    let mut rpc = RpcClient::new(client(&broker));

    let id = rpc.request("svc", json!("ping"), MessageProperties::default()).await.unwrap();
    let stale = Message::new(
        b"old".to_vec(),
        MessageProperties::new().with_correlation_id("response__from-an-earlier-run"),
    );
    broker.publish("", rpc.reply_queue(), stale).unwrap();

    let responder = tokio::spawn(reverse_echo_responder(broker.clone(), "svc".to_string(), 1));
    let responses = rpc.get_responses().await.unwrap();
    responder.await.unwrap();

    assert_eq!(responses.keys().collect::<Vec<_>>(), vec![&id]);
    assert!(broker
        .events()
        .iter()
        .any(|e| matches!(e, BrokerEvent::Rejected { requeue: true, .. })));
}

#[tokio::test]
async fn test_direct_request_leaves_pending_batch_alone() {
    let broker = broker_with("svc").await;
    let mut rpc = RpcClient::new(client(&broker));

    let first = rpc.request("svc", json!("a"), MessageProperties::default()).await.unwrap();
    let second = rpc.request("svc", json!("b"), MessageProperties::default()).await.unwrap();

    // The direct call flushes the channel, so the responder sees all three requests.
    let responder = tokio::spawn(reverse_echo_responder(broker.clone(), "svc".to_string(), 3));
    let reply = rpc.direct_request("svc", json!("direct"), MessageProperties::default()).await.unwrap();

    assert_eq!(reply, br#""direct""#.to_vec());
    assert_eq!(rpc.pending(), &[first.clone(), second.clone()]);

    let responses = rpc.get_responses().await.unwrap();
    responder.await.unwrap();

    let keys: HashSet<&String> = responses.keys().collect();
    assert_eq!(keys, HashSet::from([&first, &second]));
    assert_eq!(responses[&first], br#""a""#.to_vec());
    assert_eq!(responses[&second], br#""b""#.to_vec());
}

#[tokio::test]
async fn test_direct_request_timeout_restores_pending() {
    let broker = broker_with("svc").await;
    let mut rpc = RpcClient::new(client(&broker));
    let batched = rpc.request("svc", json!("a"), MessageProperties::default()).await.unwrap();

    let result = rpc
        .direct_request_within("svc", json!("nobody answers"), MessageProperties::default(), Duration::from_millis(30))
        .await;

    assert!(matches!(result, Err(RabbitMQError::ProtocolTimeout(_))));
    assert_eq!(rpc.pending(), &[batched]);
}

#[tokio::test]
async fn test_reply_queue_reused_across_calls() {
    let broker = broker_with("svc").await;
    let mut rpc = RpcClient::new(client(&broker));

    for round in 0..3 {
        let responder = tokio::spawn(reverse_echo_responder(broker.clone(), "svc".to_string(), 1));
        let reply = rpc.direct_request("svc", json!(round), MessageProperties::default()).await.unwrap();
        responder.await.unwrap();
        assert_eq!(reply, round.to_string().into_bytes());
    }

    let declared = broker
        .events()
        .iter()
        .filter(|e| matches!(e, BrokerEvent::QueueDeclared { name, .. } if name == rpc.reply_queue()))
        .count();
    assert_eq!(declared, 1);
    assert!(broker.has_queue(rpc.reply_queue()));
    assert_eq!(broker.consumer_count(rpc.reply_queue()), 1);

    rpc.close().await.unwrap();
    assert!(!broker.has_queue(rpc.reply_queue()));
}

#[tokio::test]
async fn test_end_to_end_with_sample_consumer() {
    let broker = broker_with(SAMPLE_EXCHANGE).await;

    let consumer_client = client(&broker);
    let mut consumer_loop = ConsumerLoop::new(consumer_client.clone(), SampleConsumer::new(consumer_client))
        .with_process_limit(Some(1));
    let consumer = tokio::spawn(async move { consumer_loop.run().await });

    let mut rpc = RpcClient::new(client(&broker));
    let reply = rpc
        .direct_request(SAMPLE_EXCHANGE, json!({"x": 1}), MessageProperties::default())
        .await
        .unwrap();

    assert_eq!(serde_json::from_slice::<Value>(&reply).unwrap(), json!({"x": 1}));

    let report = consumer.await.unwrap().unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(report.exit, ExitReason::ProcessLimit);

    let replies = broker.sent_to_queue(rpc.reply_queue());
    assert_eq!(replies.len(), 1);
    assert!(replies[0].correlation_id().is_some_and(|id| id.starts_with("response__")));
}

#[tokio::test]
async fn test_sample_consumer_answers_a_batch() {
    let broker = broker_with(SAMPLE_EXCHANGE).await;

    let consumer_client = client(&broker);
    let mut consumer_loop = ConsumerLoop::new(consumer_client.clone(), SampleConsumer::new(consumer_client))
        .with_process_limit(Some(3));
    let consumer = tokio::spawn(async move { consumer_loop.run().await });

    let mut rpc = RpcClient::new(client(&broker));
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            rpc.request(SAMPLE_EXCHANGE, json!({"n": n}), MessageProperties::default())
                .await
                .unwrap(),
        );
    }
    let responses = rpc.get_responses_within(Duration::from_secs(5)).await.unwrap();
    consumer.await.unwrap().unwrap();

    for (n, id) in ids.iter().enumerate() {
        assert_eq!(serde_json::from_slice::<Value>(&responses[id]).unwrap(), json!({"n": n}));
    }
}

#[tokio::test]
async fn test_message_without_reply_to_is_only_printed() {
    let broker = broker_with(SAMPLE_EXCHANGE).await;
    broker
        .publish(SAMPLE_EXCHANGE, "", Message::new(br#"{"x":1}"#.to_vec(), MessageProperties::default()))
        .unwrap();

    let consumer_client = client(&broker);
    let report = ConsumerLoop::new(consumer_client.clone(), SampleConsumer::new(consumer_client))
        .with_process_limit(Some(1))
        .run()
        .await
        .unwrap();

    assert_eq!(report.acked, 1);
    let publishes = broker
        .events()
        .iter()
        .filter(|e| matches!(e, BrokerEvent::Published { .. }))
        .count();
    assert_eq!(publishes, 1);
}
