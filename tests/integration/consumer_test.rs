use std::collections::HashSet;

use rabbitmq_bridge::rabbitmq::consumer::ConsumerState;
use rabbitmq_bridge::rabbitmq::memory::{BrokerEvent, MemoryBroker};
use rabbitmq_bridge::rabbitmq::{AckDecision, ConsumerLoop, ExitReason, FailureReport, RabbitMQError};
use serde_json::json;
use tokio::sync::oneshot;

use crate::support::{client, json_message, wait_until, ScriptedConsumer};

async fn broker_with(exchanges: &[&str]) -> MemoryBroker {
    let broker = MemoryBroker::new();
    let setup = client(&broker);
    for exchange in exchanges {
        setup.declare_exchange(exchange, false).await.unwrap();
    }
    setup.close().await.unwrap();
    broker
}

fn settlements(broker: &MemoryBroker) -> Vec<BrokerEvent> {
    broker
        .events()
        .into_iter()
        .filter(|event| matches!(event, BrokerEvent::Acked { .. } | BrokerEvent::Rejected { .. }))
        .collect()
}

fn settled_tag(event: &BrokerEvent) -> u64 {
    match event {
        BrokerEvent::Acked { delivery_tag } | BrokerEvent::Rejected { delivery_tag, .. } => *delivery_tag,
        other => panic!("not a settlement: {:?}", other),
    }
}

#[tokio::test]
async fn test_process_limit_stops_after_three_of_five() {
    let broker = broker_with(&["work"]).await;
    for n in 0..5 {
        broker.publish("work", "", json_message(json!({"n": n}))).unwrap();
    }

    let client = client(&broker);
    let mut consumer_loop = ConsumerLoop::new(client.clone(), ScriptedConsumer::new("work", vec![]))
        .with_process_limit(Some(3));
    let report = consumer_loop.run().await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.acked, 3);
    assert_eq!(report.exit, ExitReason::ProcessLimit);
    assert_eq!(broker.queue_depth("work"), 2);
    assert_eq!(broker.unacked_count(), 0);

    assert_eq!(consumer_loop.state(), ConsumerState::Closed);
    assert!(!client.is_connected().await);
    let events = broker.events();
    assert!(events.iter().any(|e| matches!(e, BrokerEvent::ChannelClosed { .. })));
    assert!(events.iter().any(|e| matches!(e, BrokerEvent::ConnectionClosed { .. })));
}

#[tokio::test]
async fn test_prefetch_of_one_on_consumer_channel() {
    let broker = broker_with(&["work"]).await;
    broker.publish("work", "", json_message(json!(1))).unwrap();

    let mut consumer_loop = ConsumerLoop::new(client(&broker), ScriptedConsumer::new("work", vec![]))
        .with_process_limit(Some(1));
    consumer_loop.run().await.unwrap();

    assert!(broker
        .events()
        .iter()
        .any(|e| matches!(e, BrokerEvent::Qos { prefetch_count: 1, .. })));
}

#[tokio::test]
async fn test_ack_reject_and_requeue_branches() {
    let broker = broker_with(&["work"]).await;
    for body in ["a", "b", "c"] {
        broker.publish("work", "", json_message(json!(body))).unwrap();
    }

    let consumer = ScriptedConsumer::new(
        "work",
        vec![
            Ok(AckDecision::from_code(1)),
            Ok(AckDecision::from_code(0)),
            Ok(AckDecision::from_code(2)),
        ],
    );
    let seen = consumer.seen();
    let mut consumer_loop = ConsumerLoop::new(client(&broker), consumer).with_process_limit(Some(4));
    let report = consumer_loop.run().await.unwrap();

    assert_eq!(report.acked, 2);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.requeued, 1);

    let settled = settlements(&broker);
    assert!(matches!(settled[0], BrokerEvent::Acked { .. }));
    assert!(matches!(settled[1], BrokerEvent::Rejected { requeue: false, .. }));
    assert!(matches!(settled[2], BrokerEvent::Rejected { requeue: true, .. }));
    assert!(matches!(settled[3], BrokerEvent::Acked { .. }));

    // The requeued message comes back and is handled again.
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[2], seen[3]);
    assert_eq!(broker.queue_depth("work"), 0);
}

#[tokio::test]
async fn test_every_delivery_settled_exactly_once() {
    let broker = broker_with(&["work", "errors"]).await;
    for n in 0..6 {
        broker.publish("work", "", json_message(json!(n))).unwrap();
    }

    let consumer = ScriptedConsumer::new(
        "work",
        vec![
            Ok(AckDecision::Ack),
            Err("boom".to_string()),
            Ok(AckDecision::Reject),
            Ok(AckDecision::Requeue),
            Ok(AckDecision::from(true)),
        ],
    )
    .reporting_to("errors");
    let mut consumer_loop = ConsumerLoop::new(client(&broker), consumer).with_process_limit(Some(7));
    let report = consumer_loop.run().await.unwrap();

    let settled = settlements(&broker);
    let tags: HashSet<u64> = settled.iter().map(settled_tag).collect();
    assert_eq!(settled.len() as u64, report.processed);
    assert_eq!(tags.len(), settled.len());
}

#[tokio::test]
async fn test_handler_error_rejects_and_reports_once() {
    let broker = broker_with(&["work", "errors"]).await;
    broker.publish("work", "", json_message(json!({"order": 42}))).unwrap();

    let consumer = ScriptedConsumer::new("work", vec![Err("database unavailable".to_string())])
        .reporting_to("errors");
    let mut consumer_loop = ConsumerLoop::new(client(&broker), consumer).with_process_limit(Some(1));
    let report = consumer_loop.run().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.acked, 0);
    assert!(settlements(&broker)
        .iter()
        .all(|e| matches!(e, BrokerEvent::Rejected { requeue: false, .. })));

    let reports = broker.published_to("errors");
    assert_eq!(reports.len(), 1);
    let failure: FailureReport = serde_json::from_slice(&reports[0].body).unwrap();
    assert!(failure.handler.ends_with("ScriptedConsumer"));
    assert_eq!(failure.error, "Message handler failed: database unavailable");
    assert_eq!(failure.message, json!({"order": 42}));
    assert_eq!(broker.queue_depth("work"), 0);
}

#[tokio::test]
async fn test_failure_reported_even_when_reject_fails() {
    let broker = broker_with(&["work", "errors"]).await;
    broker.publish("work", "", json_message(json!({"order": 7}))).unwrap();
    broker.fail_next_settles(1);

    let client = client(&broker);
    let consumer = ScriptedConsumer::new("work", vec![Err("ledger offline".to_string())])
        .reporting_to("errors");
    let result = ConsumerLoop::new(client.clone(), consumer)
        .with_process_limit(Some(1))
        .run()
        .await;

    assert!(matches!(result, Err(RabbitMQError::AckError(_))));
    let reports = broker.published_to("errors");
    assert_eq!(reports.len(), 1);
    let failure: FailureReport = serde_json::from_slice(&reports[0].body).unwrap();
    assert_eq!(failure.message, json!({"order": 7}));

    // The unsettled delivery goes back to the queue when the channel closes.
    assert!(!client.is_connected().await);
    assert_eq!(broker.queue_depth("work"), 1);
}

#[tokio::test]
async fn test_handler_error_without_error_exchange_publishes_nothing() {
    let broker = broker_with(&["work"]).await;
    broker.publish("work", "", json_message(json!(1))).unwrap();

    let consumer = ScriptedConsumer::new("work", vec![Err("bad".to_string())]);
    let mut consumer_loop = ConsumerLoop::new(client(&broker), consumer).with_process_limit(Some(1));
    let report = consumer_loop.run().await.unwrap();

    assert_eq!(report.failed, 1);
    let publishes = broker
        .events()
        .iter()
        .filter(|e| matches!(e, BrokerEvent::Published { .. }))
        .count();
    assert_eq!(publishes, 1);
}

#[tokio::test]
async fn test_failed_report_publish_does_not_stop_loop() {
    // "missing" is never declared, so the report publish fails.
    let broker = broker_with(&["work"]).await;
    broker.publish("work", "", json_message(json!(1))).unwrap();
    broker.publish("work", "", json_message(json!(2))).unwrap();

    let consumer = ScriptedConsumer::new("work", vec![Err("first fails".to_string())])
        .reporting_to("missing");
    let mut consumer_loop = ConsumerLoop::new(client(&broker), consumer).with_process_limit(Some(2));
    let report = consumer_loop.run().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.acked, 1);
}

#[tokio::test]
async fn test_deliveries_handled_in_broker_order() {
    let broker = broker_with(&["work"]).await;
    for n in 0..4 {
        broker.publish("work", "", json_message(json!(n))).unwrap();
    }

    let consumer = ScriptedConsumer::new("work", vec![]);
    let seen = consumer.seen();
    ConsumerLoop::new(client(&broker), consumer)
        .with_process_limit(Some(4))
        .run()
        .await
        .unwrap();

    let expected: Vec<Vec<u8>> = (0..4).map(|n| n.to_string().into_bytes()).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_cancelled_consumer_ends_loop() {
    let broker = broker_with(&["work"]).await;
    let client = client(&broker);
    let mut consumer_loop = ConsumerLoop::new(client.clone(), ScriptedConsumer::new("work", vec![]));

    let handle = tokio::spawn(async move { consumer_loop.run().await });
    wait_until(|| broker.consumer_count("work") == 1).await;
    broker.publish("work", "", json_message(json!("before cancel"))).unwrap();
    wait_until(|| broker.queue_depth("work") == 0 && broker.unacked_count() == 0).await;

    broker.cancel_consumers("work");
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.exit, ExitReason::ConsumerCancelled);
    assert_eq!(report.processed, 1);
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_shutdown_signal_ends_loop() {
    let broker = broker_with(&["work"]).await;
    let (stop, stopped) = oneshot::channel::<()>();
    let mut consumer_loop = ConsumerLoop::new(client(&broker), ScriptedConsumer::new("work", vec![]))
        .with_shutdown(async move {
            let _ = stopped.await;
        });

    let handle = tokio::spawn(async move { consumer_loop.run().await });
    wait_until(|| broker.consumer_count("work") == 1).await;
    stop.send(()).unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.exit, ExitReason::Shutdown);
    assert_eq!(report.processed, 0);
    assert_eq!(broker.consumer_count("work"), 0);
}

#[tokio::test]
async fn test_loop_runs_only_once() {
    let broker = broker_with(&["work"]).await;
    broker.publish("work", "", json_message(json!(1))).unwrap();

    let mut consumer_loop = ConsumerLoop::new(client(&broker), ScriptedConsumer::new("work", vec![]))
        .with_process_limit(Some(1));
    consumer_loop.run().await.unwrap();

    let second = consumer_loop.run().await;
    assert!(matches!(second, Err(RabbitMQError::ConsumeError(_))));
}

#[tokio::test]
async fn test_bind_failure_still_closes_connection() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let result = ConsumerLoop::new(client.clone(), ScriptedConsumer::new("undeclared", vec![]))
        .run()
        .await;

    assert!(matches!(result, Err(RabbitMQError::ChannelError(_))));
    assert!(!client.is_connected().await);
    assert!(broker
        .events()
        .iter()
        .any(|e| matches!(e, BrokerEvent::ConnectionClosed { .. })));
}
