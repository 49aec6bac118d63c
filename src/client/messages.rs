//! Messages exchanged between the supervisor, its worker and its children

use crate::config::SpecificConfig;
use crate::error::{BrokerError, ConnectionFailure, ConnectivityError};
use crate::model::{ClientState, ConsumerKey, OutboundSignal, ResourceStatus, Source};
use crate::transport::{
    BrokerConnection, BrokerConsumer, BrokerSession, ConnectionEvent, ConnectionListener,
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Correlates a worker reply or a timeout with the request it belongs to
pub type RequestId = u64;

/// Lifecycle command issued by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Open,
    Close,
    Test,
}

/// Successful completion of a lifecycle command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Connected,
    Disconnected,
    TestSucceeded,
}

pub type CommandResult = Result<CommandOutcome, ConnectivityError>;

/// A live connection and its current session
#[derive(Clone)]
pub struct ClientResources {
    pub connection: Arc<dyn BrokerConnection>,
    pub session: Arc<dyn BrokerSession>,
}

/// A broker consumer bound to the source configuration it was created for
#[derive(Clone)]
pub struct ConsumerData {
    pub key: ConsumerKey,
    pub source: Arc<Source>,
    pub handle: Arc<dyn BrokerConsumer>,
}

/// Requests handled sequentially by the connection-handling worker
pub enum WorkerRequest {
    Connect {
        request_id: RequestId,
        client_id: String,
        config: SpecificConfig,
        listener: ConnectionListener,
    },
    RecoverSession {
        request_id: RequestId,
        connection: Arc<dyn BrokerConnection>,
        session: Arc<dyn BrokerSession>,
    },
    Disconnect {
        request_id: RequestId,
        connection: Option<Arc<dyn BrokerConnection>>,
        force: bool,
    },
}

pub enum WorkerReply {
    ClientConnected {
        resources: ClientResources,
        consumers: Vec<ConsumerData>,
    },
    SessionRecovered {
        session: Arc<dyn BrokerSession>,
        consumers: Vec<ConsumerData>,
    },
    ClientDisconnected,
    ConnectionFailure(ConnectionFailure),
}

/// Everything a supervisor's inbox accepts
pub enum SupervisorMessage {
    Command {
        command: LifecycleCommand,
        reply: oneshot::Sender<CommandResult>,
    },
    RetrieveStatus {
        reply: oneshot::Sender<Vec<ResourceStatus>>,
    },
    GetState {
        reply: oneshot::Sender<ClientState>,
    },
    Publish(OutboundSignal),
    Worker {
        request_id: RequestId,
        reply: WorkerReply,
    },
    StateTimeout {
        request_id: RequestId,
    },
    /// Event from the broker connection opened as `generation`
    Broker {
        generation: u64,
        event: ConnectionEvent,
    },
    /// A consumer failed to install its listener and wants a new session
    ConsumerFailed {
        key: ConsumerKey,
        cause: BrokerError,
    },
    Shutdown,
}
