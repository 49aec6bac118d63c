//! Connectivity service tests
//!
//! The registry of connections and the fan-out of lifecycle commands to the
//! clients of each connection.

mod test_helpers;

use broker_connectivity::client::CommandOutcome;
use broker_connectivity::config::ConnectivityConfig;
use broker_connectivity::error::ConnectivityError;
use broker_connectivity::model::{
    ConnectionId, ConnectivityStatus, OutboundSignal, ResourceType,
};
use broker_connectivity::testing::{
    wait_until, AcknowledgementSink, MockBroker, MockInboundProcessor,
};
use broker_connectivity::ConnectivityService;
use std::sync::Arc;
use test_helpers::{connection, fast_settings, test_connection, WAIT};

fn service(broker: &MockBroker) -> ConnectivityService {
    ConnectivityService::new(broker.factory(), Arc::new(MockInboundProcessor::new()))
        .with_settings(fast_settings())
}

fn pooled_connection(id: &str) -> broker_connectivity::model::Connection {
    connection(&format!(
        r#"
id = "{id}"
uri = "amqp://broker:5672"
client_count = 2

[[sources]]
addresses = ["telemetry"]

[[targets]]
address = "events/{{{{ entity:id }}}}"
topics = ["*"]
"#
    ))
}

#[tokio::test]
async fn test_add_connection_registers_without_io() {
    let broker = MockBroker::new();
    let service = service(&broker);

    service.add_connection(test_connection("registered")).await.unwrap();

    assert_eq!(service.connection_ids().await, vec![ConnectionId::from("registered")]);
    assert_eq!(broker.counts().total(), 0);
}

#[tokio::test]
async fn test_duplicate_connection_is_rejected() {
    let broker = MockBroker::new();
    let service = service(&broker);
    service.add_connection(test_connection("dup")).await.unwrap();

    let result = service.add_connection(test_connection("dup")).await;

    assert!(matches!(result, Err(ConnectivityError::DuplicateConnection(ref id)) if id == "dup"));
    assert_eq!(service.connection_ids().await.len(), 1);
}

#[tokio::test]
async fn test_invalid_connection_is_not_registered() {
    let broker = MockBroker::new();
    let service = service(&broker);
    let mut invalid = test_connection("invalid");
    invalid.uri = "ftp://broker".to_string();

    let result = service.add_connection(invalid).await;

    assert!(matches!(result, Err(ConnectivityError::Config(_))));
    assert!(service.connection_ids().await.is_empty());
}

#[tokio::test]
async fn test_commands_for_unknown_connection_fail() {
    let broker = MockBroker::new();
    let service = service(&broker);
    let id = ConnectionId::from("missing");

    assert!(matches!(service.open(&id).await, Err(ConnectivityError::UnknownConnection(_))));
    assert!(matches!(service.close(&id).await, Err(ConnectivityError::UnknownConnection(_))));
    assert!(matches!(
        service.retrieve_status(&id).await,
        Err(ConnectivityError::UnknownConnection(_))
    ));
    assert!(matches!(
        service.remove_connection(&id).await,
        Err(ConnectivityError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn test_open_and_close_fan_out_to_every_client() {
    // Arrange
    let broker = MockBroker::new();
    let service = service(&broker);
    let id = ConnectionId::from("pooled");
    service.add_connection(pooled_connection("pooled")).await.unwrap();

    // Act
    let opened = service.open(&id).await;

    // Assert: one broker connection and consumer per client
    assert!(matches!(opened, Ok(CommandOutcome::Connected)));
    let counts = broker.counts();
    assert_eq!(counts.connections_created, 2);
    assert_eq!(counts.consumers_created, 2);

    let mut client_ids = broker.client_ids().await;
    client_ids.sort();
    assert!(client_ids[0].starts_with("pooled:0-"));
    assert!(client_ids[1].starts_with("pooled:1-"));

    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.active_consumers("telemetry").await == 2 }
        })
        .await
    );
    let statuses = service.retrieve_status(&id).await.unwrap();
    let clients: Vec<_> = statuses
        .iter()
        .filter(|s| s.resource_type == ResourceType::Client)
        .collect();
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().all(|s| s.status == ConnectivityStatus::Open));

    assert!(matches!(service.close(&id).await, Ok(CommandOutcome::Disconnected)));
    assert_eq!(broker.counts().connections_closed, 2);
}

#[tokio::test]
async fn test_config_settings_are_applied_per_connection() {
    let broker = MockBroker::new();
    let service = service(&broker);
    let config = ConnectivityConfig::from_toml_str(
        r#"
[connection]
id = "from-config"
uri = "amqp://broker:5672"

[[connection.sources]]
addresses = ["telemetry"]
consumer_count = 3
"#,
    )
    .unwrap();

    service.add_config(config).await.unwrap();
    service.open(&ConnectionId::from("from-config")).await.unwrap();

    assert_eq!(broker.counts().consumers_created, 3);
}

#[tokio::test]
async fn test_test_conflicts_with_connected_registration() {
    let broker = MockBroker::new();
    let service = service(&broker);
    service.add_connection(test_connection("busy")).await.unwrap();
    service.open(&ConnectionId::from("busy")).await.unwrap();

    let result = service.test(test_connection("busy")).await;

    assert!(matches!(result, Err(ConnectivityError::AlreadyConnected(ref id)) if id == "busy"));
    assert_eq!(broker.counts().connections_created, 1);
}

#[tokio::test]
async fn test_test_of_unregistered_connection_leaves_nothing_open() {
    let broker = MockBroker::new();
    let service = service(&broker);

    let result = service.test(test_connection("trial")).await;

    assert!(matches!(result, Ok(CommandOutcome::TestSucceeded)));
    let counts = broker.counts();
    assert_eq!(counts.connections_created, 1);
    assert_eq!(counts.connections_closed, 1);
    assert!(service.connection_ids().await.is_empty());
}

#[tokio::test]
async fn test_publish_routes_signal_through_one_client() {
    let broker = MockBroker::new();
    let (mut sink, acks) = AcknowledgementSink::channel();
    let service = service(&broker).with_acknowledgements(acks);
    let id = ConnectionId::from("publishing");
    service.add_connection(pooled_connection("publishing")).await.unwrap();
    service.open(&id).await.unwrap();

    for i in 0..4 {
        let signal = OutboundSignal::new(format!("s-{i}"), "things/twin", "{}")
            .with_entity("org:device")
            .with_ack_request("delivered");
        service.publish(&id, signal).await.unwrap();
    }

    let received = sink.wait_for(4, WAIT).await;
    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|ack| ack.is_success() && ack.address == "events/org:device"));
    // Same entity, same client: only one producer exists
    assert_eq!(broker.counts().producers_created, 1);
}

#[tokio::test]
async fn test_remove_connection_closes_and_forgets() {
    let broker = MockBroker::new();
    let service = service(&broker);
    let id = ConnectionId::from("removed");
    service.add_connection(test_connection("removed")).await.unwrap();
    service.open(&id).await.unwrap();

    service.remove_connection(&id).await.unwrap();

    assert!(service.connection_ids().await.is_empty());
    assert_eq!(broker.counts().connections_closed, 1);
    assert!(matches!(service.open(&id).await, Err(ConnectivityError::UnknownConnection(_))));

    // The id can be registered again
    service.add_connection(test_connection("removed")).await.unwrap();
}

#[tokio::test]
async fn test_connections_open_independently() {
    let broker = MockBroker::new();
    let service = service(&broker);
    let ids: Vec<ConnectionId> = (0..3)
        .map(|i| ConnectionId::new(format!("parallel-{i}")))
        .collect();
    for id in &ids {
        service.add_connection(test_connection(id.as_str())).await.unwrap();
    }

    let results = futures::future::join_all(ids.iter().map(|id| service.open(id))).await;

    assert!(results.iter().all(|r| matches!(r, Ok(CommandOutcome::Connected))));
    assert_eq!(broker.counts().connections_created, 3);
    assert_eq!(service.connection_ids().await, ids);
}
