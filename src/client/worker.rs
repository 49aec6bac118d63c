//! Connection-handling worker
//!
//! Performs every blocking broker operation on behalf of one supervisor. The
//! worker keeps no lifecycle state of its own: requests are handled strictly
//! one after another and each one carries the resources it operates on.

use crate::client::messages::{
    ClientResources, ConsumerData, RequestId, SupervisorMessage, WorkerReply, WorkerRequest,
};
use crate::config::SpecificConfig;
use crate::error::{BrokerError, ConnectionFailure, FailureStage};
use crate::model::Connection;
use crate::observability::metrics;
use crate::transport::{
    BrokerClientFactory, BrokerConnection, BrokerConsumer, BrokerSession, ConnectionListener,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sends requests to a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerRequest>,
}

impl WorkerHandle {
    /// Returns false once the worker has stopped
    pub fn send(&self, request: WorkerRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

pub struct ConnectionWorker {
    connection: Arc<Connection>,
    factory: Arc<dyn BrokerClientFactory>,
    replies: mpsc::WeakUnboundedSender<SupervisorMessage>,
}

impl ConnectionWorker {
    pub fn new(
        connection: Arc<Connection>,
        factory: Arc<dyn BrokerClientFactory>,
        replies: mpsc::WeakUnboundedSender<SupervisorMessage>,
    ) -> Self {
        Self {
            connection,
            factory,
            replies,
        }
    }

    /// Spawn the worker task; it stops when every handle is dropped
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (WorkerHandle { tx }, task)
    }

    async fn run(self, mut requests: mpsc::UnboundedReceiver<WorkerRequest>) {
        while let Some(request) = requests.recv().await {
            let (request_id, reply) = self.handle(request).await;
            let delivered = self
                .replies
                .upgrade()
                .map(|tx| tx.send(SupervisorMessage::Worker { request_id, reply }).is_ok())
                .unwrap_or(false);
            if !delivered {
                debug!(connection_id = %self.connection.id, "Supervisor gone, worker stopping");
                break;
            }
        }
    }

    async fn handle(&self, request: WorkerRequest) -> (RequestId, WorkerReply) {
        match request {
            WorkerRequest::Connect {
                request_id,
                client_id,
                config,
                listener,
            } => {
                let started = Instant::now();
                let reply = match self.connect(&client_id, &config, listener).await {
                    Ok((resources, consumers)) => {
                        metrics::metrics().record_connection_established(started.elapsed());
                        WorkerReply::ClientConnected {
                            resources,
                            consumers,
                        }
                    }
                    Err(failure) => {
                        metrics::metrics().record_connection_failure();
                        warn!(
                            connection_id = %self.connection.id,
                            client_id = %client_id,
                            error = %failure,
                            "Connecting to broker failed"
                        );
                        WorkerReply::ConnectionFailure(failure)
                    }
                };
                (request_id, reply)
            }
            WorkerRequest::RecoverSession {
                request_id,
                connection,
                session,
            } => {
                let reply = match self.recover_session(connection.as_ref(), session).await {
                    Ok((session, consumers)) => {
                        WorkerReply::SessionRecovered { session, consumers }
                    }
                    Err(failure) => WorkerReply::ConnectionFailure(failure),
                };
                (request_id, reply)
            }
            WorkerRequest::Disconnect {
                request_id,
                connection,
                force,
            } => {
                if let Some(connection) = connection {
                    self.disconnect(connection.as_ref(), force).await;
                }
                (request_id, WorkerReply::ClientDisconnected)
            }
        }
    }

    /// Create connection, start it, open a session and all consumers
    ///
    /// Anything already opened is closed again when a later step fails.
    async fn connect(
        &self,
        client_id: &str,
        config: &SpecificConfig,
        listener: ConnectionListener,
    ) -> Result<(ClientResources, Vec<ConsumerData>), ConnectionFailure> {
        metrics::metrics().record_connection_attempt();
        info!(
            connection_id = %self.connection.id,
            client_id = %client_id,
            host = %config.host,
            port = config.port,
            "Connecting to broker"
        );

        let connection = self
            .factory
            .create_connection(&self.connection, config, client_id, listener)
            .await
            .map_err(|e| ConnectionFailure::new(FailureStage::Connection, e))?;

        if let Err(e) = connection.start().await {
            close_connection_quietly(connection.as_ref()).await;
            return Err(ConnectionFailure::new(FailureStage::Connection, e));
        }

        let session = match connection.create_session().await {
            Ok(session) => session,
            Err(e) => {
                close_connection_quietly(connection.as_ref()).await;
                return Err(ConnectionFailure::new(FailureStage::Session, e));
            }
        };

        let consumers = match self.create_consumers(&session).await {
            Ok(consumers) => consumers,
            Err(e) => {
                close_session_quietly(session.as_ref()).await;
                close_connection_quietly(connection.as_ref()).await;
                return Err(ConnectionFailure::new(FailureStage::Consumer, e));
            }
        };

        info!(
            connection_id = %self.connection.id,
            client_id = %client_id,
            consumers = consumers.len(),
            "Broker connection established"
        );

        Ok((
            ClientResources {
                connection,
                session,
            },
            consumers,
        ))
    }

    async fn create_consumers(
        &self,
        session: &Arc<dyn BrokerSession>,
    ) -> Result<Vec<ConsumerData>, BrokerError> {
        let mut consumers = Vec::with_capacity(self.connection.expected_consumer_count());

        for key in self.connection.consumer_keys() {
            match session.create_consumer(&key.address).await {
                Ok(handle) => {
                    let source = Arc::new(self.connection.sources[key.source_index].clone());
                    consumers.push(ConsumerData {
                        key,
                        source,
                        handle,
                    });
                }
                Err(e) => {
                    warn!(
                        connection_id = %self.connection.id,
                        address = %key.address,
                        error = %e,
                        "Consumer creation failed"
                    );
                    for created in &consumers {
                        close_consumer_quietly(created.handle.as_ref()).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(consumers)
    }

    /// Replace the session of a live connection
    ///
    /// The old session is always closed first, even if it still looks healthy.
    async fn recover_session(
        &self,
        connection: &dyn BrokerConnection,
        old_session: Arc<dyn BrokerSession>,
    ) -> Result<(Arc<dyn BrokerSession>, Vec<ConsumerData>), ConnectionFailure> {
        info!(connection_id = %self.connection.id, "Recovering broker session");
        close_session_quietly(old_session.as_ref()).await;

        let session = connection
            .create_session()
            .await
            .map_err(|e| ConnectionFailure::new(FailureStage::Session, e))?;

        match self.create_consumers(&session).await {
            Ok(consumers) => {
                metrics::metrics().record_session_recovery();
                Ok((session, consumers))
            }
            Err(e) => {
                close_session_quietly(session.as_ref()).await;
                Err(ConnectionFailure::new(FailureStage::Consumer, e))
            }
        }
    }

    /// Stop and close; errors are logged and never reported
    async fn disconnect(&self, connection: &dyn BrokerConnection, force: bool) {
        if !force {
            if let Err(e) = connection.stop().await {
                warn!(
                    connection_id = %self.connection.id,
                    error = %e,
                    "Stopping connection failed"
                );
            }
        }
        if let Err(e) = connection.close().await {
            warn!(connection_id = %self.connection.id, error = %e, "Closing connection failed");
        }
        info!(connection_id = %self.connection.id, force, "Broker connection closed");
    }
}

async fn close_connection_quietly(connection: &dyn BrokerConnection) {
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Ignoring error while closing connection");
    }
}

async fn close_session_quietly(session: &dyn BrokerSession) {
    if let Err(e) = session.close().await {
        debug!(error = %e, "Ignoring error while closing session");
    }
}

async fn close_consumer_quietly(consumer: &dyn BrokerConsumer) {
    if let Err(e) = consumer.close().await {
        debug!(error = %e, "Ignoring error while closing consumer");
    }
}
