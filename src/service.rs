//! Lifecycle command surface
//!
//! [`ConnectivityService`] keeps a registry of connections. Each registered
//! connection owns a pool of `client_count` supervisors; commands addressed to
//! a connection fan out to every client of its pool.

use crate::client::{
    CommandOutcome, DefaultStatusResolver, StatusResolver, SupervisorBuilder, SupervisorHandle,
    SupervisorSettings,
};
use crate::config::ConnectivityConfig;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::mapping::{DefaultOutboundMapper, InboundProcessor, OutboundMapper};
use crate::model::{
    Acknowledgement, ClientState, Connection, ConnectionId, OutboundSignal, ResourceStatus,
};
use crate::transport::BrokerClientFactory;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// The supervisors of one registered connection
#[derive(Clone)]
struct ClientPool {
    connection: Arc<Connection>,
    clients: Vec<SupervisorHandle>,
}

impl ClientPool {
    /// Signals about the same entity always go through the same client
    fn route(&self, signal: &OutboundSignal) -> Option<&SupervisorHandle> {
        if self.clients.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        signal
            .entity_id
            .as_deref()
            .unwrap_or(&signal.id)
            .hash(&mut hasher);
        let index = (hasher.finish() % self.clients.len() as u64) as usize;
        self.clients.get(index)
    }

    fn shutdown(&self) {
        for client in &self.clients {
            client.shutdown();
        }
    }
}

pub struct ConnectivityService {
    factory: Arc<dyn BrokerClientFactory>,
    processor: Arc<dyn InboundProcessor>,
    mapper: Arc<dyn OutboundMapper>,
    resolver: Arc<dyn StatusResolver>,
    settings: SupervisorSettings,
    acknowledgements: Option<mpsc::UnboundedSender<Acknowledgement>>,
    pools: Arc<RwLock<HashMap<ConnectionId, ClientPool>>>,
}

impl ConnectivityService {
    pub fn new(
        factory: Arc<dyn BrokerClientFactory>,
        processor: Arc<dyn InboundProcessor>,
    ) -> Self {
        Self {
            factory,
            processor,
            mapper: Arc::new(DefaultOutboundMapper),
            resolver: Arc::new(DefaultStatusResolver),
            settings: SupervisorSettings::default(),
            acknowledgements: None,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Settings for connections registered with [`Self::add_connection`]
    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn OutboundMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn StatusResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_acknowledgements(mut self, sink: mpsc::UnboundedSender<Acknowledgement>) -> Self {
        self.acknowledgements = Some(sink);
        self
    }

    /// Validate and register a connection; no broker I/O happens here
    pub async fn add_connection(&self, connection: Connection) -> ConnectivityResult<()> {
        let settings = self.settings.clone();
        self.register(connection, settings).await
    }

    /// Register the connection of a loaded configuration with its own settings
    pub async fn add_config(&self, config: ConnectivityConfig) -> ConnectivityResult<()> {
        let settings = SupervisorSettings::from(&config);
        self.register(config.connection, settings).await
    }

    async fn register(
        &self,
        connection: Connection,
        settings: SupervisorSettings,
    ) -> ConnectivityResult<()> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(&connection.id) {
            return Err(ConnectivityError::DuplicateConnection(
                connection.id.to_string(),
            ));
        }

        let mut clients = Vec::with_capacity(connection.client_count);
        for index in 0..connection.client_count {
            match self.builder(connection.clone(), settings.clone(), index).spawn() {
                Ok(client) => clients.push(client),
                Err(e) => {
                    for client in &clients {
                        client.shutdown();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            connection_id = %connection.id,
            clients = clients.len(),
            "Connection registered"
        );
        pools.insert(
            connection.id.clone(),
            ClientPool {
                connection: Arc::new(connection),
                clients,
            },
        );
        Ok(())
    }

    fn builder(
        &self,
        connection: Connection,
        settings: SupervisorSettings,
        index: usize,
    ) -> SupervisorBuilder {
        let mut builder = SupervisorBuilder::new(
            connection,
            Arc::clone(&self.factory),
            Arc::clone(&self.processor),
        )
        .settings(settings)
        .mapper(Arc::clone(&self.mapper))
        .resolver(Arc::clone(&self.resolver))
        .client_index(index);
        if let Some(acks) = &self.acknowledgements {
            builder = builder.acknowledgements(acks.clone());
        }
        builder
    }

    async fn pool(&self, id: &ConnectionId) -> ConnectivityResult<ClientPool> {
        self.pools
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConnectivityError::UnknownConnection(id.to_string()))
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Open every client of the connection
    ///
    /// Clients that opened stay open when a later one fails; the first
    /// failure is returned.
    pub async fn open(&self, id: &ConnectionId) -> ConnectivityResult<CommandOutcome> {
        let pool = self.pool(id).await?;
        let mut first_failure = None;
        for client in &pool.clients {
            if let Err(e) = client.open().await {
                warn!(
                    connection_id = %id,
                    client_id = %client.client_id(),
                    error = %e,
                    "Opening client failed"
                );
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(CommandOutcome::Connected),
        }
    }

    /// Close every client of the connection; closing a closed client succeeds
    pub async fn close(&self, id: &ConnectionId) -> ConnectivityResult<CommandOutcome> {
        let pool = self.pool(id).await?;
        let mut first_failure = None;
        for client in &pool.clients {
            if let Err(e) = client.close().await {
                warn!(
                    connection_id = %id,
                    client_id = %client.client_id(),
                    error = %e,
                    "Closing client failed"
                );
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(CommandOutcome::Disconnected),
        }
    }

    /// Check that `connection` can be established, without keeping it
    ///
    /// Fails with [`ConnectivityError::AlreadyConnected`] when a registered
    /// connection with the same id is currently connected.
    pub async fn test(&self, connection: Connection) -> ConnectivityResult<CommandOutcome> {
        if let Ok(pool) = self.pool(&connection.id).await {
            for client in &pool.clients {
                if client.state().await? == ClientState::Connected {
                    return Err(ConnectivityError::AlreadyConnected(
                        connection.id.to_string(),
                    ));
                }
            }
        }

        let id = connection.id.clone();
        let trial = self.builder(connection, self.settings.clone(), 0).spawn()?;
        let result = trial.test().await;
        trial.shutdown();
        info!(connection_id = %id, success = result.is_ok(), "Connection test finished");
        result
    }

    /// Status of every resource of every client of the connection
    pub async fn retrieve_status(
        &self,
        id: &ConnectionId,
    ) -> ConnectivityResult<Vec<ResourceStatus>> {
        let pool = self.pool(id).await?;
        let mut statuses = Vec::new();
        for client in &pool.clients {
            statuses.extend(client.retrieve_status().await);
        }
        Ok(statuses)
    }

    /// Hand a signal to the publisher of one client of the connection
    pub async fn publish(
        &self,
        id: &ConnectionId,
        signal: OutboundSignal,
    ) -> ConnectivityResult<()> {
        let pool = self.pool(id).await?;
        match pool.route(&signal) {
            Some(client) => client.publish(signal),
            None => Err(ConnectivityError::UnknownConnection(id.to_string())),
        }
    }

    /// Close the connection and forget it
    pub async fn remove_connection(&self, id: &ConnectionId) -> ConnectivityResult<()> {
        let pool = self.pool(id).await?;
        if let Err(e) = self.close(id).await {
            warn!(connection_id = %id, error = %e, "Closing removed connection failed");
        }
        pool.shutdown();
        self.pools.write().await.remove(id);
        info!(connection_id = %pool.connection.id, "Connection removed");
        Ok(())
    }
}
