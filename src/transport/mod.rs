//! Broker client boundary
//!
//! The connectivity core never speaks a wire protocol itself. It drives a
//! broker client library through the traits below, which expose the
//! connect / create-session / create-consumer / create-producer / send
//! primitives and can fail or asynchronously signal interruption.
//!
//! [`mqtt`] provides an implementation on top of `rumqttc`; the
//! [`crate::testing::mocks`] module provides one for tests.

use crate::config::SpecificConfig;
use crate::error::BrokerError;
use crate::model::{Connection, ExternalMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod mqtt;

/// Asynchronous signal from a live broker connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The connection to the broker was lost
    Interrupted { cause: BrokerError },
    /// The broker client re-established the connection on its own
    Restored,
}

/// Callback registered once at connect time
///
/// Invoked from the broker client's own context; implementations only post
/// the event somewhere and return.
pub type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Invoked when the broker closes the channel underneath a producer
pub type ProducerClosedListener = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Broker-level disposition of a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Permanently acknowledged
    Accepted,
    /// Rejected without requeue
    Rejected,
    /// Released so the broker redelivers
    Released,
}

/// Opaque capability to settle one delivered message
#[async_trait]
pub trait SettlementToken: Send + Sync {
    async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError>;
}

/// A raw message handed from a broker consumer to its listener
pub struct InboundDelivery {
    /// Address the broker delivered on
    pub address: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub settlement: Box<dyn SettlementToken>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("address", &self.address)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Builds broker connections
#[async_trait]
pub trait BrokerClientFactory: Send + Sync {
    async fn create_connection(
        &self,
        connection: &Connection,
        config: &SpecificConfig,
        client_id: &str,
        listener: ConnectionListener,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn start(&self) -> Result<(), BrokerError>;

    async fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;

    /// Stop message delivery without releasing the connection
    async fn stop(&self) -> Result<(), BrokerError>;

    /// Release the connection and everything created on it
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_consumer(&self, address: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;

    async fn create_producer(
        &self,
        address: &str,
        on_closed: ProducerClosedListener,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn address(&self) -> &str;

    /// Route every delivery of this consumer into `listener`
    async fn set_listener(
        &self,
        listener: mpsc::Sender<InboundDelivery>,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    fn address(&self) -> &str;

    async fn send(&self, message: &ExternalMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
