//! Lifecycle state machine of a connection supervisor
//!
//! [`transition`] is a pure function: given the current state and an event it
//! returns the next state and the effects the supervisor must execute. All
//! I/O, timers and replies happen in the supervisor; nothing here blocks.
//!
//! ```text
//! DISCONNECTED --Open--> CONNECTING --ClientConnected--> CONNECTED
//! CONNECTING --ConnectionFailed--> DISCONNECTED (failure retained)
//! CONNECTED --Close--> DISCONNECTING --ClientDisconnected--> DISCONNECTED
//! DISCONNECTED --Test--> TESTING --ClientConnected--> TESTING (disconnect)
//! TESTING --ClientDisconnected--> DISCONNECTED (test succeeded)
//! CONNECTING | DISCONNECTING | TESTING --StateTimeout--> DISCONNECTED
//! ```

use crate::model::{ClientState, ConnectivityStatus};

/// Inputs of the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    Open,
    Close,
    Test,
    ClientConnected,
    ClientDisconnected,
    ConnectionFailed { status: ConnectivityStatus },
    SessionRecovered,
    /// The pending worker request did not answer in time
    StateTimeout,
    Interrupted { status: ConnectivityStatus },
    Restored,
    /// A consumer could not install its listener and asks for a fresh session
    RecoveryRequested,
}

/// Reply to the command origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Connected,
    Disconnected,
    TestSucceeded,
    AlreadyConnected,
    Busy,
    /// Carries the failure of the triggering event
    Failure,
    Timeout,
}

/// Work the supervisor performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ask the worker to connect (with timeout)
    Connect,
    /// Ask the worker to disconnect the held resources (with timeout)
    Disconnect,
    /// Ask the worker for a new session on the held connection
    RecoverSession,
    /// Spawn consumers and the publisher for the established connection
    StartChildren,
    StopChildren,
    /// Hand recovered consumer handles to the running consumers
    ReplaceConsumers,
    ClearFailure,
    RetainFailure(ConnectivityStatus),
    PublishClientStatus(ConnectivityStatus),
    Reply(Reply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ClientState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ClientState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: ClientState, effects: Vec<Effect>) -> Self {
        Self::to(state, effects)
    }
}

/// Compute the next state and its effects (pure function)
pub fn transition(state: ClientState, event: FsmEvent) -> Transition {
    use ClientState::*;

    match (state, event) {
        (Disconnected, FsmEvent::Open) => {
            Transition::to(Connecting, vec![Effect::ClearFailure, Effect::Connect])
        }
        (Disconnected, FsmEvent::Close) => {
            Transition::stay(state, vec![Effect::Reply(Reply::Disconnected)])
        }
        (Disconnected, FsmEvent::Test) => Transition::to(Testing, vec![Effect::Connect]),

        (
            Connecting | Disconnecting | Testing,
            FsmEvent::Open | FsmEvent::Close | FsmEvent::Test,
        ) => Transition::stay(state, vec![Effect::Reply(Reply::Busy)]),

        (Connecting, FsmEvent::ClientConnected) => Transition::to(
            Connected,
            vec![
                Effect::StartChildren,
                Effect::PublishClientStatus(ConnectivityStatus::Open),
                Effect::Reply(Reply::Connected),
            ],
        ),
        (Connecting, FsmEvent::ConnectionFailed { status }) => Transition::to(
            Disconnected,
            vec![Effect::RetainFailure(status), Effect::Reply(Reply::Failure)],
        ),
        (Connecting, FsmEvent::StateTimeout) => Transition::to(
            Disconnected,
            vec![
                Effect::RetainFailure(ConnectivityStatus::Failed),
                Effect::Reply(Reply::Timeout),
            ],
        ),

        (Connected, FsmEvent::Open) => {
            Transition::stay(state, vec![Effect::Reply(Reply::Connected)])
        }
        (Connected, FsmEvent::Close) => Transition::to(
            Disconnecting,
            vec![Effect::StopChildren, Effect::Disconnect],
        ),
        (Connected, FsmEvent::Test) => {
            Transition::stay(state, vec![Effect::Reply(Reply::AlreadyConnected)])
        }
        (Connected, FsmEvent::Interrupted { status }) => {
            Transition::stay(state, vec![Effect::PublishClientStatus(status)])
        }
        (Connected, FsmEvent::Restored | FsmEvent::RecoveryRequested) => {
            Transition::stay(state, vec![Effect::RecoverSession])
        }
        (Connected, FsmEvent::SessionRecovered) => Transition::stay(
            state,
            vec![
                Effect::ReplaceConsumers,
                Effect::PublishClientStatus(ConnectivityStatus::Open),
            ],
        ),
        // Session recovery failed or timed out; the connection stays up
        (Connected, FsmEvent::ConnectionFailed { status }) => {
            Transition::stay(state, vec![Effect::PublishClientStatus(status)])
        }
        (Connected, FsmEvent::StateTimeout) => Transition::stay(
            state,
            vec![Effect::PublishClientStatus(ConnectivityStatus::Failed)],
        ),

        (Disconnecting, FsmEvent::ClientDisconnected) => {
            Transition::to(Disconnected, vec![Effect::Reply(Reply::Disconnected)])
        }
        (Disconnecting, FsmEvent::StateTimeout) => {
            Transition::to(Disconnected, vec![Effect::Reply(Reply::Timeout)])
        }

        (Testing, FsmEvent::ClientConnected) => Transition::stay(state, vec![Effect::Disconnect]),
        (Testing, FsmEvent::ClientDisconnected) => {
            Transition::to(Disconnected, vec![Effect::Reply(Reply::TestSucceeded)])
        }
        (Testing, FsmEvent::ConnectionFailed { .. }) => {
            Transition::to(Disconnected, vec![Effect::Reply(Reply::Failure)])
        }
        (Testing, FsmEvent::StateTimeout) => {
            Transition::to(Disconnected, vec![Effect::Reply(Reply::Timeout)])
        }

        // Stale or irrelevant for the current state
        _ => Transition::stay(state, Vec::new()),
    }
}
