//! Publisher backpressure and producer backoff tests
//!
//! The publisher holds at most `max_queue_size + parallelism` messages, keeps
//! at most `parallelism` sends in flight and drops what does not fit. Addresses
//! whose producer the broker closed are rejected until their backoff passes.

mod test_helpers;

use broker_connectivity::client::QUEUE_FULL_REASON;
use broker_connectivity::error::BrokerError;
use broker_connectivity::model::{AckStatus, ConnectivityStatus, OutboundSignal, ResourceType};
use broker_connectivity::testing::{
    wait_until, AcknowledgementSink, MockBroker, MockInboundProcessor, MockOperation,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{
    connection, fast_settings, resource_status, spawn_supervisor, test_connection, WAIT,
};

const ADDRESS: &str = "events/org:device";

fn signal(id: &str) -> OutboundSignal {
    OutboundSignal::new(id, "things/twin", "{\"state\":\"on\"}")
        .with_entity("org:device")
        .with_ack_request("delivered")
}

#[tokio::test]
async fn test_queue_overflow_drops_exactly_the_excess() {
    // Arrange: 2 in flight + 3 queued, every send held by the broker
    let broker = MockBroker::new();
    broker.gate_sends().await;
    let (mut sink, acks) = AcknowledgementSink::channel();
    let mut settings = fast_settings();
    settings.publisher.parallelism = 2;
    settings.publisher.max_queue_size = 3;
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        test_connection("overflow"),
        settings,
        Some(acks),
    );
    client.open().await.unwrap();

    // Act
    for i in 0..10 {
        client.publish(signal(&format!("s-{i}"))).unwrap();
    }

    // Assert: five drops, reported immediately
    let dropped = sink.wait_for(5, WAIT).await.to_vec();
    assert_eq!(dropped.len(), 5);
    assert!(dropped
        .iter()
        .all(|ack| ack.status == AckStatus::Failed
            && ack.reason.as_deref() == Some(QUEUE_FULL_REASON)));
    let mut dropped_ids: Vec<_> = dropped.iter().map(|ack| ack.signal_id.clone()).collect();
    dropped_ids.sort();
    assert_eq!(dropped_ids, vec!["s-5", "s-6", "s-7", "s-8", "s-9"]);

    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.in_flight() == 2 }
        })
        .await
    );

    // Releasing the broker completes everything that was accepted
    broker.open_send_gate().await;
    let all = sink.wait_for(10, WAIT).await;
    assert_eq!(all.len(), 10);
    assert_eq!(all.iter().filter(|ack| ack.is_success()).count(), 5);
    assert_eq!(broker.sent().await.len(), 5);
    assert!(broker.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_parallelism_limits_in_flight_sends() {
    let broker = MockBroker::new();
    broker.gate_sends().await;
    let (mut sink, acks) = AcknowledgementSink::channel();
    let mut settings = fast_settings();
    settings.publisher.parallelism = 3;
    settings.publisher.max_queue_size = 100;
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        test_connection("parallel"),
        settings,
        Some(acks),
    );
    client.open().await.unwrap();

    for i in 0..20 {
        client.publish(signal(&format!("p-{i}"))).unwrap();
    }
    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.in_flight() == 3 }
        })
        .await
    );

    // Let sends through a few at a time
    for _ in 0..10 {
        broker.release_sends(2).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    broker.open_send_gate().await;

    let all = sink.wait_for(20, WAIT).await;
    assert_eq!(all.len(), 20);
    assert!(all.iter().all(|ack| ack.is_success()));
    assert_eq!(broker.max_in_flight(), 3);
    assert_eq!(broker.counts().producers_created, 1);
}

#[tokio::test]
async fn test_closed_producer_backs_off_then_recovers() {
    // Arrange
    let broker = MockBroker::new();
    let (mut sink, acks) = AcknowledgementSink::channel();
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        test_connection("backoff"),
        fast_settings(),
        Some(acks),
    );
    client.open().await.unwrap();
    client.publish(signal("first")).unwrap();
    assert!(sink.wait_for(1, WAIT).await[0].is_success());

    // Act: the broker closes the link
    assert_eq!(broker.close_producer(ADDRESS).await, 1);
    let c = client.clone();
    assert!(
        wait_until(WAIT, || {
            let c = c.clone();
            async move {
                resource_status(&c.retrieve_status().await, ResourceType::Target, ADDRESS)
                    == Some(ConnectivityStatus::Failed)
            }
        })
        .await
    );

    // Assert: rejected while backing off
    client.publish(signal("during-backoff")).unwrap();
    let rejected = sink.wait_for(2, WAIT).await[1].clone();
    assert_eq!(rejected.signal_id, "during-backoff");
    assert_eq!(rejected.status, AckStatus::Failed);
    assert!(rejected.reason.unwrap_or_default().contains("backing off"));
    assert_eq!(broker.counts().producers_created, 1);

    // After the window a new producer is created on demand
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.publish(signal("after-backoff")).unwrap();
    let recovered = sink.wait_for(3, WAIT).await[2].clone();
    assert_eq!(recovered.signal_id, "after-backoff");
    assert!(recovered.is_success());
    assert_eq!(broker.counts().producers_created, 2);
    assert_eq!(
        resource_status(&client.retrieve_status().await, ResourceType::Target, ADDRESS),
        Some(ConnectivityStatus::Open)
    );
}

#[tokio::test]
async fn test_producer_creation_failure_backs_off() {
    let broker = MockBroker::new();
    broker
        .fail_next(MockOperation::CreateProducer, BrokerError::io("link refused"))
        .await;
    let (mut sink, acks) = AcknowledgementSink::channel();
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        test_connection("create-failure"),
        fast_settings(),
        Some(acks),
    );
    client.open().await.unwrap();

    client.publish(signal("a")).unwrap();
    client.publish(signal("b")).unwrap();

    let received = sink.wait_for(2, WAIT).await;
    assert!(received.iter().all(|ack| ack.status == AckStatus::Failed));
    assert_eq!(broker.counts().producers_created, 1, "second message waits out the backoff");
    assert_eq!(broker.counts().sends, 0);
}

#[tokio::test]
async fn test_signals_reach_only_subscribed_targets() {
    let broker = MockBroker::new();
    let conn = connection(
        r#"
id = "topics"
uri = "amqp://broker:5672"

[[targets]]
address = "twin/{{ entity:id }}"
topics = ["things/twin"]

[targets.header_mapping]
"device" = "{{ entity:name }}"

[[targets]]
address = "live/{{ entity:name }}"
topics = ["things/live"]
"#,
    );
    let (mut sink, acks) = AcknowledgementSink::channel();
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        conn,
        fast_settings(),
        Some(acks),
    );
    client.open().await.unwrap();

    client.publish(signal("twin-only")).unwrap();

    let received = sink.wait_for(1, WAIT).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].address, "twin/org:device");
    let sent = broker.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, "twin/org:device");
    assert_eq!(sent[0].message.header("device"), Some("device"));
}

#[tokio::test]
async fn test_unresolvable_address_fails_acknowledgement() {
    let broker = MockBroker::new();
    let (mut sink, acks) = AcknowledgementSink::channel();
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        test_connection("unresolvable"),
        fast_settings(),
        Some(acks),
    );
    client.open().await.unwrap();

    // No entity: `{{ entity:id }}` cannot be resolved
    let anonymous =
        OutboundSignal::new("anonymous", "things/twin", "{}").with_ack_request("delivered");
    client.publish(anonymous).unwrap();

    let received = sink.wait_for(1, WAIT).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].status, AckStatus::Failed);
    assert_eq!(broker.counts().producers_created, 0);
}

#[tokio::test]
async fn test_signals_without_ack_request_are_not_acknowledged() {
    let broker = MockBroker::new();
    let (mut sink, acks) = AcknowledgementSink::channel();
    let client = spawn_supervisor(
        &broker,
        Arc::new(MockInboundProcessor::new()),
        test_connection("fire-and-forget"),
        fast_settings(),
        Some(acks),
    );
    client.open().await.unwrap();

    client
        .publish(OutboundSignal::new("quiet", "things/twin", "{}").with_entity("org:device"))
        .unwrap();

    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.sent().await.len() == 1 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.drain().is_empty());
}
