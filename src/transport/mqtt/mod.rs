//! MQTT 5 implementation of the broker client traits
//!
//! - [`options`] - pure option building and error classification
//! - [`router`] - topic-filter routing and acknowledgement bookkeeping
//! - [`client`] - the `rumqttc` connection, sessions, consumers and producers
//!
//! # Usage
//!
//! ```rust,no_run
//! use broker_connectivity::transport::mqtt::MqttClientFactory;
//! use broker_connectivity::ConnectivityService;
//! use broker_connectivity::mapping::InboundProcessor;
//! use std::sync::Arc;
//!
//! # fn processor() -> Arc<dyn InboundProcessor> { unimplemented!() }
//! let service = ConnectivityService::new(Arc::new(MqttClientFactory), processor());
//! ```

pub mod client;
pub mod options;
pub mod router;

pub use client::{MqttClientFactory, MqttConnection, MqttConsumer, MqttProducer, MqttSession};
pub use options::{classify_connect_code, mqtt_options};
pub use router::{topic_matches, SubscriptionRouter};
