//! Supervisor lifecycle tests
//!
//! Open, close and test commands against the mock broker, including failure
//! classification, worker timeouts and commands arriving mid-transition.

mod test_helpers;

use broker_connectivity::client::{CommandOutcome, SupervisorBuilder};
use broker_connectivity::config::ConfigError;
use broker_connectivity::error::{BrokerError, ConnectivityError, FailureStage};
use broker_connectivity::model::{AckStatus, ClientState, ConnectivityStatus, OutboundSignal};
use broker_connectivity::testing::{
    wait_until, AcknowledgementSink, MockBroker, MockInboundProcessor, MockOperation,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{client_status, fast_settings, spawn_supervisor, test_connection, WAIT};

fn processor() -> Arc<MockInboundProcessor> {
    Arc::new(MockInboundProcessor::new())
}

#[tokio::test]
async fn test_open_connects_and_starts_consumers() {
    // Arrange
    let broker = MockBroker::new();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("lifecycle"),
        fast_settings(),
        None,
    );

    // Act
    let outcome = client.open().await;

    // Assert
    assert!(matches!(outcome, Ok(CommandOutcome::Connected)));
    assert_eq!(client.state().await.unwrap(), ClientState::Connected);

    let counts = broker.counts();
    assert_eq!(counts.connections_created, 1);
    assert_eq!(counts.starts, 1);
    assert_eq!(counts.sessions_created, 1);
    assert_eq!(counts.consumers_created, 2);

    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.active_consumers("telemetry").await == 2 }
        })
        .await
    );
    assert_eq!(client_status(&client.retrieve_status().await), ConnectivityStatus::Open);
}

#[tokio::test]
async fn test_broker_client_id_is_derived_from_client_id() {
    let broker = MockBroker::new();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("ids"),
        fast_settings(),
        None,
    );

    client.open().await.unwrap();

    assert_eq!(client.client_id(), "ids:0");
    let ids = broker.client_ids().await;
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("ids:0-"));
}

#[tokio::test]
async fn test_open_and_close_are_idempotent() {
    let broker = MockBroker::new();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("idempotent"),
        fast_settings(),
        None,
    );

    assert!(matches!(client.close().await, Ok(CommandOutcome::Disconnected)));
    assert_eq!(broker.counts().total(), 0, "closing a closed client touches nothing");

    client.open().await.unwrap();
    assert!(matches!(client.open().await, Ok(CommandOutcome::Connected)));
    assert_eq!(broker.counts().connections_created, 1);

    assert!(matches!(client.close().await, Ok(CommandOutcome::Disconnected)));
    assert!(matches!(client.close().await, Ok(CommandOutcome::Disconnected)));

    let counts = broker.counts();
    assert_eq!(counts.stops, 1);
    assert_eq!(counts.connections_closed, 1);
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);
    assert_eq!(client_status(&client.retrieve_status().await), ConnectivityStatus::Closed);
}

#[tokio::test]
async fn test_security_failure_is_misconfigured() {
    // Arrange: the broker refuses the credentials once
    let broker = MockBroker::new();
    broker
        .fail_next(
            MockOperation::Start,
            BrokerError::authentication("bad credentials for user=device password=secret"),
        )
        .await;
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("security"),
        fast_settings(),
        None,
    );

    // Act
    let result = client.open().await;

    // Assert: classified, retained and sanitized
    match result {
        Err(ConnectivityError::ConnectionFailed { status, failure }) => {
            assert_eq!(status, ConnectivityStatus::Misconfigured);
            assert_eq!(failure.stage, FailureStage::Connection);
        }
        other => panic!("expected connection failure, got {other:?}"),
    }
    assert_eq!(broker.counts().connections_closed, 1, "started connection is released");

    let statuses = client.retrieve_status().await;
    assert_eq!(client_status(&statuses), ConnectivityStatus::Misconfigured);
    let details = statuses[0].status_details.clone().unwrap_or_default();
    assert!(!details.contains("secret"));

    // A later open clears the retained failure
    client.open().await.unwrap();
    assert_eq!(client_status(&client.retrieve_status().await), ConnectivityStatus::Open);
}

#[tokio::test]
async fn test_session_failure_is_failed_and_releases_connection() {
    let broker = MockBroker::new();
    broker
        .fail_next(MockOperation::CreateSession, BrokerError::io("channel limit reached"))
        .await;
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("session-failure"),
        fast_settings(),
        None,
    );

    let error = client.open().await.unwrap_err();

    assert_eq!(error.status(), ConnectivityStatus::Failed);
    assert!(matches!(
        error,
        ConnectivityError::ConnectionFailed { ref failure, .. }
            if failure.stage == FailureStage::Session
    ));
    assert_eq!(broker.counts().connections_closed, 1);
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);
    assert_eq!(client_status(&client.retrieve_status().await), ConnectivityStatus::Failed);
}

#[tokio::test]
async fn test_consumer_failure_closes_session_and_connection() {
    let broker = MockBroker::new();
    broker
        .fail_next(
            MockOperation::CreateConsumer,
            BrokerError::security("not allowed to read 'telemetry'"),
        )
        .await;
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("consumer-failure"),
        fast_settings(),
        None,
    );

    let error = client.open().await.unwrap_err();

    assert_eq!(error.status(), ConnectivityStatus::Misconfigured);
    assert!(matches!(
        error,
        ConnectivityError::ConnectionFailed { ref failure, .. }
            if failure.stage == FailureStage::Consumer
    ));
    let counts = broker.counts();
    assert_eq!(counts.sessions_closed, 1);
    assert_eq!(counts.connections_closed, 1);
}

#[tokio::test]
async fn test_connect_timeout_releases_late_connection() {
    // Arrange: the broker answers after the supervisor gave up
    let broker = MockBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(300))).await;
    let mut settings = fast_settings();
    settings.client.connect_timeout_ms = 100;
    let client = spawn_supervisor(&broker, processor(), test_connection("timeout"), settings, None);

    // Act
    let result = client.open().await;

    // Assert
    assert!(matches!(
        result,
        Err(ConnectivityError::Timeout { state: ClientState::Connecting, timeout_ms: 100 })
    ));
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);
    assert_eq!(client_status(&client.retrieve_status().await), ConnectivityStatus::Failed);

    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.counts().connections_closed == 1 }
        })
        .await,
        "late connection must be torn down"
    );
    assert_eq!(broker.active_consumers("telemetry").await, 0);
}

#[tokio::test]
async fn test_commands_during_transition_are_busy() {
    let broker = MockBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(200))).await;
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("busy"),
        fast_settings(),
        None,
    );

    let opening = {
        let client = client.clone();
        tokio::spawn(async move { client.open().await })
    };
    let c = client.clone();
    assert!(
        wait_until(WAIT, || {
            let c = c.clone();
            async move { c.state().await.ok() == Some(ClientState::Connecting) }
        })
        .await
    );

    assert!(matches!(
        client.close().await,
        Err(ConnectivityError::Busy { state: ClientState::Connecting })
    ));
    assert!(matches!(client.test().await, Err(ConnectivityError::Busy { .. })));

    assert!(matches!(opening.await.unwrap(), Ok(CommandOutcome::Connected)));
    let statuses = client.retrieve_status().await;
    assert_eq!(client_status(&statuses), ConnectivityStatus::Open);
}

#[tokio::test]
async fn test_test_command_connects_and_disconnects() {
    let broker = MockBroker::new();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("trial"),
        fast_settings(),
        None,
    );

    assert!(matches!(client.test().await, Ok(CommandOutcome::TestSucceeded)));

    let counts = broker.counts();
    assert_eq!(counts.connections_created, 1);
    assert_eq!(counts.connections_closed, 1);
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);
    assert_eq!(client_status(&client.retrieve_status().await), ConnectivityStatus::Closed);
}

#[tokio::test]
async fn test_test_command_conflicts_with_open_client() {
    let broker = MockBroker::new();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("conflict"),
        fast_settings(),
        None,
    );
    client.open().await.unwrap();

    let result = client.test().await;

    assert!(matches!(result, Err(ConnectivityError::AlreadyConnected(ref id)) if id == "conflict"));
    assert_eq!(broker.counts().connections_created, 1);
    assert_eq!(client.state().await.unwrap(), ClientState::Connected);
}

#[tokio::test]
async fn test_failed_test_reports_failure() {
    let broker = MockBroker::new();
    broker
        .fail_next(MockOperation::CreateConnection, BrokerError::io("connection refused"))
        .await;
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("failed-trial"),
        fast_settings(),
        None,
    );

    let error = client.test().await.unwrap_err();

    assert_eq!(error.status(), ConnectivityStatus::Failed);
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_releases_connection() {
    let broker = MockBroker::new();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("shutdown"),
        fast_settings(),
        None,
    );
    client.open().await.unwrap();

    client.shutdown();

    let b = broker.clone();
    assert!(
        wait_until(WAIT, || {
            let b = b.clone();
            async move { b.counts().connections_closed == 1 }
        })
        .await
    );
    let c = client.clone();
    assert!(
        wait_until(WAIT, || {
            let c = c.clone();
            async move { c.state().await.is_err() }
        })
        .await
    );
    assert!(matches!(client.open().await, Err(ConnectivityError::SupervisorGone)));

    let statuses = client.retrieve_status().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(client_status(&statuses), ConnectivityStatus::Failed);
}

#[tokio::test]
async fn test_publish_while_disconnected_fails_acknowledgement() {
    let broker = MockBroker::new();
    let (mut sink, acks) = AcknowledgementSink::channel();
    let client = spawn_supervisor(
        &broker,
        processor(),
        test_connection("offline"),
        fast_settings(),
        Some(acks),
    );

    let signal = OutboundSignal::new("s-1", "things/twin", "{}")
        .with_entity("org:device")
        .with_ack_request("delivered");
    client.publish(signal).unwrap();

    let received = sink.wait_for(1, WAIT).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].status, AckStatus::Failed);
    assert_eq!(received[0].reason.as_deref(), Some("client is DISCONNECTED"));
    assert_eq!(broker.counts().sends, 0);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_before_io() {
    let broker = MockBroker::new();
    let mut connection = test_connection("invalid");
    connection
        .specific_config
        .insert("jms.prefetch".to_string(), "10".to_string());

    let result = SupervisorBuilder::new(connection, broker.factory(), processor()).spawn();

    assert!(matches!(result, Err(ConfigError::InvalidSpecificConfig { .. })));
    assert_eq!(broker.counts().total(), 0);
}
