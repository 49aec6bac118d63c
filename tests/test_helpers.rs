//! Test helpers and utilities for integration tests

use broker_connectivity::client::{SupervisorBuilder, SupervisorHandle, SupervisorSettings};
use broker_connectivity::config::{ClientSection, ConsumerSection, PublisherSection};
use broker_connectivity::mapping::InboundProcessor;
use broker_connectivity::model::{
    Acknowledgement, Connection, ConnectivityStatus, ResourceStatus, ResourceType,
};
use broker_connectivity::testing::MockBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(2);

/// Parse a connection from TOML
#[allow(dead_code)]
pub fn connection(toml_content: &str) -> Connection {
    toml::from_str(toml_content).expect("test connection should parse")
}

/// One source address with two consumers and one catch-all target
#[allow(dead_code)]
pub fn test_connection(id: &str) -> Connection {
    connection(&format!(
        r#"
id = "{id}"
uri = "amqp://broker:5672"

[[sources]]
addresses = ["telemetry"]
consumer_count = 2
authorization_context = ["integration:test"]

[[targets]]
address = "events/{{{{ entity:id }}}}"
topics = ["*"]
"#
    ))
}

/// Short timeouts so failure paths finish quickly
#[allow(dead_code)]
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        client: ClientSection {
            connect_timeout_ms: 1_000,
            disconnect_timeout_ms: 1_000,
            test_timeout_ms: 1_000,
        },
        publisher: PublisherSection {
            max_queue_size: 10,
            parallelism: 1,
            backoff_initial_ms: 100,
            backoff_max_ms: 400,
        },
        consumer: ConsumerSection {
            max_recovery_attempts: 3,
        },
    }
}

/// Spawn a supervisor for `connection` on the mock broker
#[allow(dead_code)]
pub fn spawn_supervisor(
    broker: &MockBroker,
    processor: Arc<dyn InboundProcessor>,
    connection: Connection,
    settings: SupervisorSettings,
    acks: Option<mpsc::UnboundedSender<Acknowledgement>>,
) -> SupervisorHandle {
    let mut builder =
        SupervisorBuilder::new(connection, broker.factory(), processor).settings(settings);
    if let Some(acks) = acks {
        builder = builder.acknowledgements(acks);
    }
    builder.spawn().expect("test connection should be valid")
}

#[allow(dead_code)]
pub fn client_status(statuses: &[ResourceStatus]) -> ConnectivityStatus {
    statuses
        .iter()
        .find(|s| s.resource_type == ResourceType::Client)
        .map(|s| s.status)
        .expect("client record is always present")
}

#[allow(dead_code)]
pub fn resource_status(
    statuses: &[ResourceStatus],
    resource_type: ResourceType,
    address: &str,
) -> Option<ConnectivityStatus> {
    statuses
        .iter()
        .find(|s| s.resource_type == resource_type && s.address.as_deref() == Some(address))
        .map(|s| s.status)
}
