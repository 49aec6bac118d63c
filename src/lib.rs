//! Broker Connectivity
//!
//! Client-side connectivity to external message brokers: connection lifecycle
//! supervision, inbound consumers with settlement, and outbound publishing with
//! bounded queues and producer backoff.
//!
//! # Overview
//!
//! - Connection model, validation and broker-specific configuration
//! - A lifecycle state machine per logical client (open, close, test,
//!   recovery after interruption) with timeouts on every broker round trip
//! - Consumers that hand inbound messages to a mapping pipeline and settle
//!   them according to its outcome
//! - A publisher with a bounded queue, limited parallelism, per-address
//!   producer backoff and acknowledgements
//! - Resource status aggregation for every client, consumer and publisher
//! - An MQTT 5 broker client and in-memory mocks for tests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use broker_connectivity::testing::{MockBroker, MockInboundProcessor};
//! use broker_connectivity::{ConnectivityConfig, ConnectivityService, OutboundSignal};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ConnectivityConfig::from_toml_str(
//!     r#"
//! [connection]
//! id = "telemetry"
//! uri = "amqp://broker:5672"
//!
//! [[connection.sources]]
//! addresses = ["telemetry/tenant"]
//!
//! [[connection.targets]]
//! address = "events/{{ entity:id }}"
//! topics = ["*"]
//! "#,
//! )?;
//! let id = config.connection.id.clone();
//!
//! let broker = MockBroker::new();
//! let service = ConnectivityService::new(broker.factory(), Arc::new(MockInboundProcessor::new()));
//! service.add_config(config).await?;
//! service.open(&id).await?;
//!
//! let signal = OutboundSignal::new("signal-1", "things/twin", "{}").with_entity("org:device");
//! service.publish(&id, signal).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod mapping;
pub mod model;
pub mod observability;
pub mod placeholders;
pub mod service;
pub mod testing;
pub mod transport;

pub use client::{CommandOutcome, SupervisorBuilder, SupervisorHandle, SupervisorSettings};
pub use config::{ConfigError, ConnectivityConfig, SpecificConfig};
pub use error::{
    BrokerError, BrokerErrorKind, ConnectionFailure, ConnectivityError, ConnectivityResult,
    FailureStage,
};
pub use model::*;
pub use service::ConnectivityService;
