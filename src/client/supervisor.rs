//! Connection supervisor
//!
//! One supervisor owns the lifecycle of one logical client of a connection.
//! It runs the state machine in [`fsm`](super::fsm), delegates every broker
//! operation to its worker with an explicit timeout, starts and stops the
//! consumers and the publisher, and answers status queries. It never blocks:
//! everything it does is a message send.

use crate::client::consumer::{spawn_consumer, ConsumerContext, ConsumerHandle};
use crate::client::fsm::{self, Effect, FsmEvent, Reply, Transition};
use crate::client::messages::{
    ClientResources, CommandOutcome, CommandResult, ConsumerData, LifecycleCommand, RequestId,
    SupervisorMessage, WorkerReply, WorkerRequest,
};
use crate::client::publisher::{spawn_publisher, PublisherContext, PublisherHandle};
use crate::client::resolver::{DefaultStatusResolver, StatusResolver};
use crate::client::status::{aggregate, StatusInputs};
use crate::client::worker::{ConnectionWorker, WorkerHandle};
use crate::config::{
    ClientSection, ConfigError, ConnectivityConfig, ConsumerSection, PublisherSection,
    SpecificConfig,
};
use crate::error::{sanitize_error_message, ConnectionFailure, ConnectivityError};
use crate::mapping::{DefaultOutboundMapper, InboundProcessor, OutboundMapper};
use crate::model::{
    Acknowledgement, ClientState, Connection, ConnectivityStatus, ConsumerKey, OutboundSignal,
    ResourceStatus, ResourceType, StatusReport,
};
use crate::observability::metrics;
use crate::transport::{BrokerClientFactory, ConnectionEvent, ConnectionListener};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Timeouts and limits of one supervisor and its children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorSettings {
    pub client: ClientSection,
    pub publisher: PublisherSection,
    pub consumer: ConsumerSection,
}

impl From<&ConnectivityConfig> for SupervisorSettings {
    fn from(config: &ConnectivityConfig) -> Self {
        Self {
            client: config.client.clone(),
            publisher: config.publisher.clone(),
            consumer: config.consumer.clone(),
        }
    }
}

/// Builds and spawns a supervisor
pub struct SupervisorBuilder {
    connection: Connection,
    factory: Arc<dyn BrokerClientFactory>,
    processor: Arc<dyn InboundProcessor>,
    mapper: Arc<dyn OutboundMapper>,
    resolver: Arc<dyn StatusResolver>,
    settings: SupervisorSettings,
    acknowledgements: Option<mpsc::UnboundedSender<Acknowledgement>>,
    client_index: usize,
}

impl SupervisorBuilder {
    pub fn new(
        connection: Connection,
        factory: Arc<dyn BrokerClientFactory>,
        processor: Arc<dyn InboundProcessor>,
    ) -> Self {
        Self {
            connection,
            factory,
            processor,
            mapper: Arc::new(DefaultOutboundMapper),
            resolver: Arc::new(DefaultStatusResolver),
            settings: SupervisorSettings::default(),
            acknowledgements: None,
            client_index: 0,
        }
    }

    pub fn settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn mapper(mut self, mapper: Arc<dyn OutboundMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn StatusResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Where the publisher sends acknowledgements of outbound signals
    pub fn acknowledgements(mut self, sink: mpsc::UnboundedSender<Acknowledgement>) -> Self {
        self.acknowledgements = Some(sink);
        self
    }

    /// Index of this client among the connection's `client_count` clients
    pub fn client_index(mut self, index: usize) -> Self {
        self.client_index = index;
        self
    }

    /// Validate the connection and spawn the supervisor with its worker
    ///
    /// Configuration problems are reported here, before any I/O.
    pub fn spawn(self) -> Result<SupervisorHandle, ConfigError> {
        self.connection.validate()?;
        self.settings.publisher.validate()?;
        let specific_config = SpecificConfig::resolve(&self.connection)?;

        let connection = Arc::new(self.connection);
        let client_id = format!("{}:{}", connection.id, self.client_index);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = tx.downgrade();

        let (worker, _worker_task) =
            ConnectionWorker::new(Arc::clone(&connection), self.factory, inbox.clone()).spawn();

        let span = crate::connection_span!(connection.id, client_id);
        let supervisor = Supervisor {
            connection,
            client_id: client_id.clone(),
            specific_config,
            settings: self.settings,
            processor: self.processor,
            mapper: self.mapper,
            resolver: self.resolver,
            acknowledgements: self.acknowledgements,
            inbox,
            worker,
            state: ClientState::Disconnected,
            state_since: Utc::now(),
            next_request_id: 0,
            pending: None,
            origin: None,
            command_reply: None,
            generation: 0,
            resources: None,
            incoming_consumers: Vec::new(),
            incoming_failure: None,
            timed_out: None,
            last_cause: None,
            consumers: BTreeMap::new(),
            publisher: None,
            client_status: StatusReport::new(ConnectivityStatus::Closed, None),
            retained_failure: None,
        };
        tokio::spawn(supervisor.run(rx).instrument(span));

        Ok(SupervisorHandle { client_id, tx })
    }
}

/// Cloneable handle to a running supervisor
///
/// The supervisor stops when [`SupervisorHandle::shutdown`] is called or the
/// last handle is dropped; held broker resources are then closed.
#[derive(Clone)]
pub struct SupervisorHandle {
    client_id: String,
    tx: mpsc::UnboundedSender<SupervisorMessage>,
}

impl SupervisorHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn open(&self) -> CommandResult {
        self.command(LifecycleCommand::Open).await
    }

    pub async fn close(&self) -> CommandResult {
        self.command(LifecycleCommand::Close).await
    }

    /// Connect and immediately disconnect again
    pub async fn test(&self) -> CommandResult {
        self.command(LifecycleCommand::Test).await
    }

    async fn command(&self, command: LifecycleCommand) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMessage::Command { command, reply })
            .map_err(|_| ConnectivityError::SupervisorGone)?;
        rx.await.map_err(|_| ConnectivityError::SupervisorGone)?
    }

    /// Always answers; a stopped supervisor reports its client as FAILED
    pub async fn retrieve_status(&self) -> Vec<ResourceStatus> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMessage::RetrieveStatus { reply })
            .is_ok()
        {
            if let Ok(statuses) = rx.await {
                return statuses;
            }
        }
        vec![ResourceStatus {
            resource_type: ResourceType::Client,
            client_id: self.client_id.clone(),
            address: None,
            status: ConnectivityStatus::Failed,
            status_details: Some("connection supervisor stopped".to_string()),
            in_state_since: Utc::now(),
        }]
    }

    pub async fn state(&self) -> Result<ClientState, ConnectivityError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMessage::GetState { reply })
            .map_err(|_| ConnectivityError::SupervisorGone)?;
        rx.await.map_err(|_| ConnectivityError::SupervisorGone)
    }

    /// Hand a signal to the publisher; fire and forget
    pub fn publish(&self, signal: OutboundSignal) -> Result<(), ConnectivityError> {
        self.tx
            .send(SupervisorMessage::Publish(signal))
            .map_err(|_| ConnectivityError::SupervisorGone)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SupervisorMessage::Shutdown);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Connect,
    Disconnect,
    Recover,
}

/// The one worker request the supervisor is waiting for
#[derive(Debug, Clone, Copy)]
struct Pending {
    id: RequestId,
    kind: PendingKind,
    state: ClientState,
    timeout: Duration,
}

struct Supervisor {
    connection: Arc<Connection>,
    client_id: String,
    specific_config: SpecificConfig,
    settings: SupervisorSettings,
    processor: Arc<dyn InboundProcessor>,
    mapper: Arc<dyn OutboundMapper>,
    resolver: Arc<dyn StatusResolver>,
    acknowledgements: Option<mpsc::UnboundedSender<Acknowledgement>>,
    inbox: mpsc::WeakUnboundedSender<SupervisorMessage>,
    worker: WorkerHandle,

    state: ClientState,
    state_since: DateTime<Utc>,
    next_request_id: RequestId,
    pending: Option<Pending>,
    /// Command waiting for the outcome of worker requests
    origin: Option<oneshot::Sender<CommandResult>>,
    /// Command currently being applied; answered directly if the transition replies
    command_reply: Option<oneshot::Sender<CommandResult>>,
    /// Incremented per connect; broker events of older connections are ignored
    generation: u64,
    resources: Option<ClientResources>,

    // Payloads of the event being applied
    incoming_consumers: Vec<ConsumerData>,
    incoming_failure: Option<ConnectionFailure>,
    timed_out: Option<Pending>,
    last_cause: Option<String>,

    consumers: BTreeMap<ConsumerKey, ConsumerHandle>,
    publisher: Option<PublisherHandle>,
    client_status: StatusReport,
    retained_failure: Option<StatusReport>,
}

impl Supervisor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SupervisorMessage>) {
        info!(
            connection_id = %self.connection.id,
            client_id = %self.client_id,
            "Supervisor started"
        );

        while let Some(message) = inbox.recv().await {
            match message {
                SupervisorMessage::Shutdown => break,
                SupervisorMessage::Command { command, reply } => {
                    self.handle_command(command, reply)
                }
                SupervisorMessage::RetrieveStatus { reply } => {
                    let _ = reply.send(self.statuses());
                }
                SupervisorMessage::GetState { reply } => {
                    let _ = reply.send(self.state);
                }
                SupervisorMessage::Publish(signal) => self.publish(signal),
                SupervisorMessage::Worker { request_id, reply } => {
                    self.handle_worker_reply(request_id, reply)
                }
                SupervisorMessage::StateTimeout { request_id } => self.handle_timeout(request_id),
                SupervisorMessage::Broker { generation, event } => {
                    self.handle_broker_event(generation, event)
                }
                SupervisorMessage::ConsumerFailed { key, cause } => {
                    warn!(consumer = %key, error = %cause, "Consumer requests session recovery");
                    self.apply(FsmEvent::RecoveryRequested);
                }
            }
        }

        self.stop();
    }

    fn handle_command(&mut self, command: LifecycleCommand, reply: oneshot::Sender<CommandResult>) {
        debug!(?command, state = %self.state, "Lifecycle command");
        let event = match command {
            LifecycleCommand::Open => FsmEvent::Open,
            LifecycleCommand::Close => FsmEvent::Close,
            LifecycleCommand::Test => FsmEvent::Test,
        };

        self.command_reply = Some(reply);
        self.apply(event);

        // No immediate answer: the command waits for the worker
        if let Some(reply) = self.command_reply.take() {
            if let Some(previous) = self.origin.replace(reply) {
                let _ = previous.send(Err(ConnectivityError::Busy { state: self.state }));
            }
        }
    }

    fn handle_worker_reply(&mut self, request_id: RequestId, reply: WorkerReply) {
        if !self.take_pending(request_id) {
            self.discard_stale(request_id, reply);
            return;
        }

        let event = match reply {
            WorkerReply::ClientConnected {
                resources,
                consumers,
            } => {
                self.resources = Some(resources);
                self.incoming_consumers = consumers;
                FsmEvent::ClientConnected
            }
            WorkerReply::SessionRecovered { session, consumers } => {
                match self.resources.as_mut() {
                    Some(resources) => resources.session = session,
                    None => {
                        close_session_detached(session);
                        return;
                    }
                }
                self.incoming_consumers = consumers;
                FsmEvent::SessionRecovered
            }
            WorkerReply::ClientDisconnected => FsmEvent::ClientDisconnected,
            WorkerReply::ConnectionFailure(failure) => {
                let status = self.resolver.resolve_failure(&failure);
                warn!(
                    state = %self.state,
                    status = %status,
                    error = %failure,
                    "Worker reported failure"
                );
                self.last_cause = Some(sanitize_error_message(&failure.to_string()));
                self.incoming_failure = Some(failure);
                FsmEvent::ConnectionFailed { status }
            }
        };

        self.apply(event);
        self.incoming_consumers.clear();
        self.incoming_failure = None;
    }

    fn handle_timeout(&mut self, request_id: RequestId) {
        let Some(pending) = self.pending.filter(|p| p.id == request_id) else {
            return;
        };
        self.pending = None;
        warn!(
            state = %self.state,
            timeout_ms = pending.timeout.as_millis() as u64,
            kind = ?pending.kind,
            "Worker did not answer in time"
        );
        self.last_cause = Some(format!(
            "no answer from connection handler within {}ms",
            pending.timeout.as_millis()
        ));
        self.timed_out = Some(pending);
        self.apply(FsmEvent::StateTimeout);
        self.timed_out = None;
    }

    fn handle_broker_event(&mut self, generation: u64, event: ConnectionEvent) {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "Ignoring event of an earlier connection"
            );
            return;
        }
        match event {
            ConnectionEvent::Interrupted { cause } => {
                let status = match self.resolver.resolve(&cause) {
                    ConnectivityStatus::Misconfigured => ConnectivityStatus::Misconfigured,
                    _ => ConnectivityStatus::Failing,
                };
                warn!(status = %status, error = %cause, "Broker connection interrupted");
                self.last_cause = Some(sanitize_error_message(&cause.to_string()));
                self.apply(FsmEvent::Interrupted { status });
            }
            ConnectionEvent::Restored => {
                info!("Broker connection restored");
                self.apply(FsmEvent::Restored);
            }
        }
    }

    fn apply(&mut self, event: FsmEvent) {
        let from = self.state;
        let Transition { next, effects } = fsm::transition(from, event);
        if next != from {
            info!(from = %from, to = %next, ?event, "Client state changed");
            self.state = next;
            self.state_since = Utc::now();
        }
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Connect => self.request_connect(),
            Effect::Disconnect => {
                let connection = self.resources.take().map(|r| r.connection);
                let timeout = if self.state == ClientState::Testing {
                    self.settings.client.test_timeout()
                } else {
                    self.settings.client.disconnect_timeout()
                };
                self.ask(PendingKind::Disconnect, timeout, |request_id| {
                    WorkerRequest::Disconnect {
                        request_id,
                        connection,
                        force: false,
                    }
                });
            }
            Effect::RecoverSession => self.request_recovery(),
            Effect::StartChildren => self.start_children(),
            Effect::StopChildren => self.stop_children(),
            Effect::ReplaceConsumers => self.replace_consumers(),
            Effect::ClearFailure => {
                self.retained_failure = None;
                self.last_cause = None;
            }
            Effect::RetainFailure(status) => {
                self.retained_failure = Some(StatusReport::new(status, self.last_cause.clone()));
            }
            Effect::PublishClientStatus(status) => {
                let details = match status {
                    ConnectivityStatus::Open => Some("connected".to_string()),
                    _ => self.last_cause.clone(),
                };
                self.client_status = StatusReport::new(status, details);
            }
            Effect::Reply(reply) => {
                let result = self.command_result(reply);
                self.reply(result);
            }
        }
    }

    fn request_connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let inbox = self.inbox.clone();
        let listener: ConnectionListener = Arc::new(move |event| {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(SupervisorMessage::Broker { generation, event });
            }
        });

        let client_id = format!("{}-{}", self.client_id, Uuid::new_v4().simple());
        let config = self.specific_config.clone();
        let timeout = if self.state == ClientState::Testing {
            self.settings.client.test_timeout()
        } else {
            self.settings.client.connect_timeout()
        };

        self.ask(PendingKind::Connect, timeout, |request_id| WorkerRequest::Connect {
            request_id,
            client_id,
            config,
            listener,
        });
    }

    fn request_recovery(&mut self) {
        if self.pending.is_some_and(|p| p.kind == PendingKind::Recover) {
            debug!("Session recovery already in progress");
            return;
        }
        let Some(resources) = self.resources.clone() else {
            return;
        };
        self.ask(
            PendingKind::Recover,
            self.settings.client.connect_timeout(),
            |request_id| WorkerRequest::RecoverSession {
                request_id,
                connection: resources.connection,
                session: resources.session,
            },
        );
    }

    /// Send a request to the worker and arm its timeout
    fn ask(
        &mut self,
        kind: PendingKind,
        timeout: Duration,
        build: impl FnOnce(RequestId) -> WorkerRequest,
    ) {
        let request_id = self.next_request_id();
        self.pending = Some(Pending {
            id: request_id,
            kind,
            state: self.state,
            timeout,
        });

        if !self.worker.send(build(request_id)) {
            error!(kind = ?kind, "Connection worker is gone");
        }

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(SupervisorMessage::StateTimeout { request_id });
            }
        });
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn take_pending(&mut self, request_id: RequestId) -> bool {
        if self.pending.is_some_and(|p| p.id == request_id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Late replies are dropped, but resources they carry must not leak
    fn discard_stale(&mut self, request_id: RequestId, reply: WorkerReply) {
        match reply {
            WorkerReply::ClientConnected { resources, .. } => {
                warn!(request_id, "Closing connection established after its request timed out");
                let cleanup_id = self.next_request_id();
                self.worker.send(WorkerRequest::Disconnect {
                    request_id: cleanup_id,
                    connection: Some(resources.connection),
                    force: true,
                });
            }
            WorkerReply::SessionRecovered { session, .. } => {
                warn!(request_id, "Closing session recovered after its request timed out");
                close_session_detached(session);
            }
            WorkerReply::ClientDisconnected | WorkerReply::ConnectionFailure(_) => {
                debug!(request_id, "Discarding stale worker reply");
            }
        }
    }

    fn start_children(&mut self) {
        let Some(resources) = &self.resources else {
            return;
        };
        let session = Arc::clone(&resources.session);

        for data in std::mem::take(&mut self.incoming_consumers) {
            self.spawn_consumer(data);
        }

        if !self.connection.targets.is_empty() {
            self.publisher = Some(spawn_publisher(
                session,
                PublisherContext {
                    connection_id: self.connection.id.to_string(),
                    targets: self.connection.targets.clone(),
                    mapper: Arc::clone(&self.mapper),
                    settings: self.settings.publisher.clone(),
                    acks: self.acknowledgements.clone(),
                },
            ));
        }
    }

    fn spawn_consumer(&mut self, data: ConsumerData) {
        let ctx = ConsumerContext {
            connection_id: self.connection.id.to_string(),
            processor: Arc::clone(&self.processor),
            resolver: Arc::clone(&self.resolver),
            supervisor: self.inbox.clone(),
            max_recovery_attempts: self.settings.consumer.max_recovery_attempts,
        };
        let handle = spawn_consumer(data.key.clone(), data.source, data.handle, ctx);
        self.consumers.insert(data.key, handle);
    }

    fn replace_consumers(&mut self) {
        for data in std::mem::take(&mut self.incoming_consumers) {
            match self.consumers.get(&data.key) {
                Some(consumer) => consumer.replace(data.handle),
                None => self.spawn_consumer(data),
            }
        }
        if let (Some(publisher), Some(resources)) = (&self.publisher, &self.resources) {
            publisher.session_recovered(Arc::clone(&resources.session));
        }
    }

    fn stop_children(&mut self) {
        for (_, consumer) in std::mem::take(&mut self.consumers) {
            drop(consumer.stop());
        }
        if let Some(publisher) = self.publisher.take() {
            drop(publisher.stop());
        }
    }

    fn command_result(&mut self, reply: Reply) -> CommandResult {
        match reply {
            Reply::Connected => Ok(CommandOutcome::Connected),
            Reply::Disconnected => Ok(CommandOutcome::Disconnected),
            Reply::TestSucceeded => Ok(CommandOutcome::TestSucceeded),
            Reply::AlreadyConnected => Err(ConnectivityError::AlreadyConnected(
                self.connection.id.to_string(),
            )),
            Reply::Busy => Err(ConnectivityError::Busy { state: self.state }),
            Reply::Failure => match self.incoming_failure.take() {
                Some(failure) => Err(ConnectivityError::ConnectionFailed {
                    status: self.resolver.resolve_failure(&failure),
                    failure,
                }),
                None => Err(ConnectivityError::SupervisorGone),
            },
            Reply::Timeout => {
                let (state, timeout) = self
                    .timed_out
                    .map(|p| (p.state, p.timeout))
                    .unwrap_or((self.state, Duration::ZERO));
                Err(ConnectivityError::Timeout {
                    state,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn reply(&mut self, result: CommandResult) {
        match self.command_reply.take().or_else(|| self.origin.take()) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(?result, "No command waiting for reply"),
        }
    }

    fn publish(&mut self, signal: OutboundSignal) {
        if let (ClientState::Connected, Some(publisher)) = (self.state, &self.publisher) {
            if publisher.publish(signal) {
                return;
            }
            warn!("Publisher stopped unexpectedly");
            return;
        }

        debug!(
            signal_id = %signal.id,
            state = %self.state,
            "Dropping signal, client not connected"
        );
        if !signal.requests_acknowledgement() {
            return;
        }
        if let Some(acks) = &self.acknowledgements {
            for target in self
                .connection
                .targets
                .iter()
                .filter(|t| t.accepts_topic(&signal.topic))
            {
                let _ = acks.send(Acknowledgement::failed(
                    &signal,
                    &target.address,
                    format!("client is {}", self.state),
                ));
            }
        }
    }

    fn current_client_status(&self) -> StatusReport {
        match self.state {
            ClientState::Connected => self.client_status.clone(),
            ClientState::Disconnected => self.retained_failure.clone().unwrap_or(StatusReport {
                status: ConnectivityStatus::Closed,
                details: None,
                since: self.state_since,
            }),
            transitional => StatusReport {
                status: ConnectivityStatus::Unknown,
                details: Some(format!("client is {transitional}")),
                since: self.state_since,
            },
        }
    }

    fn statuses(&self) -> Vec<ResourceStatus> {
        aggregate(StatusInputs {
            client_id: &self.client_id,
            connection: &self.connection,
            client: self.current_client_status(),
            connected: self.state == ClientState::Connected,
            consumers: self
                .consumers
                .iter()
                .map(|(key, consumer)| (key.clone(), consumer.status()))
                .collect(),
            targets: self
                .publisher
                .as_ref()
                .map(PublisherHandle::statuses)
                .unwrap_or_default(),
        })
    }

    /// Release everything on shutdown
    fn stop(&mut self) {
        self.stop_children();
        if let Some(resources) = self.resources.take() {
            let request_id = self.next_request_id();
            self.worker.send(WorkerRequest::Disconnect {
                request_id,
                connection: Some(resources.connection),
                force: true,
            });
        }
        let origin = self.command_reply.take().or_else(|| self.origin.take());
        if let Some(origin) = origin {
            let _ = origin.send(Err(ConnectivityError::SupervisorGone));
        }
        info!(
            connection_id = %self.connection.id,
            client_id = %self.client_id,
            "Supervisor stopped"
        );
        debug!(metrics = %metrics::metrics().snapshot().to_json(), "Connectivity metrics");
    }
}

fn close_session_detached(session: Arc<dyn crate::transport::BrokerSession>) {
    tokio::spawn(async move {
        if let Err(e) = session.close().await {
            debug!(error = %e, "Ignoring error while closing discarded session");
        }
    });
}
