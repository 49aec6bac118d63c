//! Error types for the connectivity layer
//!
//! Three boundaries, three types: [`BrokerError`] is raised by the broker
//! adapter, [`ConnectionFailure`] is what the connection-handling worker reports
//! to the supervisor, and [`ConnectivityError`] is what lifecycle commands
//! return to their caller.

use crate::config::ConfigError;
use crate::model::{ClientState, ConnectivityStatus};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Classification hint attached to every broker error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerErrorKind {
    /// Authorization or policy rejection by the broker
    Security,
    /// Bad credentials
    Authentication,
    /// Address rejected by the broker
    InvalidAddress,
    Io,
    Protocol,
    Timeout,
    /// The broker closed the channel underneath a producer
    ProducerClosed,
    /// Operation on a resource that is already closed
    Closed,
    Other,
}

impl BrokerErrorKind {
    pub fn is_security(self) -> bool {
        matches!(
            self,
            BrokerErrorKind::Security | BrokerErrorKind::Authentication
        )
    }
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerErrorKind::Security => "security",
            BrokerErrorKind::Authentication => "authentication",
            BrokerErrorKind::InvalidAddress => "invalid address",
            BrokerErrorKind::Io => "io",
            BrokerErrorKind::Protocol => "protocol",
            BrokerErrorKind::Timeout => "timeout",
            BrokerErrorKind::ProducerClosed => "producer closed",
            BrokerErrorKind::Closed => "closed",
            BrokerErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Error raised by a broker client operation
#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BrokerError {
    pub fn new<S: Into<String>>(kind: BrokerErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::new(BrokerErrorKind::Security, message)
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::new(BrokerErrorKind::Authentication, message)
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::new(BrokerErrorKind::Io, message)
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::new(BrokerErrorKind::Protocol, message)
    }

    pub fn producer_closed<S: Into<String>>(message: S) -> Self {
        Self::new(BrokerErrorKind::ProducerClosed, message)
    }

    pub fn closed<S: Into<String>>(message: S) -> Self {
        Self::new(BrokerErrorKind::Closed, message)
    }
}

/// Which step of establishing a connection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Connection,
    Session,
    Consumer,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureStage::Connection => "connection creation",
            FailureStage::Session => "session creation",
            FailureStage::Consumer => "consumer creation",
        };
        f.write_str(s)
    }
}

/// Failure reported by the connection-handling worker
#[derive(Debug, Error)]
#[error("{stage} failed: {cause}")]
pub struct ConnectionFailure {
    pub stage: FailureStage,
    #[source]
    pub cause: BrokerError,
}

impl ConnectionFailure {
    pub fn new(stage: FailureStage, cause: BrokerError) -> Self {
        Self { stage, cause }
    }
}

/// Failure of a lifecycle command
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("Configuration invalid: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed ({status}): {failure}")]
    ConnectionFailed {
        status: ConnectivityStatus,
        #[source]
        failure: ConnectionFailure,
    },

    #[error("No answer from connection handler within {timeout_ms}ms while {state}")]
    Timeout { state: ClientState, timeout_ms: u64 },

    #[error("Client is busy in state {state}")]
    Busy { state: ClientState },

    #[error("Connection '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection '{0}' is already registered")]
    DuplicateConnection(String),

    #[error("Connection supervisor is no longer running")]
    SupervisorGone,
}

impl ConnectivityError {
    /// Status the platform should report for this failure
    pub fn status(&self) -> ConnectivityStatus {
        match self {
            ConnectivityError::Config(_) => ConnectivityStatus::Misconfigured,
            ConnectivityError::ConnectionFailed { status, .. } => *status,
            ConnectivityError::Timeout { .. } => ConnectivityStatus::Failed,
            ConnectivityError::Busy { .. } => ConnectivityStatus::Unknown,
            ConnectivityError::AlreadyConnected(_) => ConnectivityStatus::Open,
            ConnectivityError::UnknownConnection(_) => ConnectivityStatus::Unknown,
            ConnectivityError::DuplicateConnection(_) => ConnectivityStatus::Misconfigured,
            ConnectivityError::SupervisorGone => ConnectivityStatus::Failed,
        }
    }
}

static URI_USERINFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z0-9+.-]*://)[^/@\s:]*(:[^/@\s]*)?@").expect("valid regex")
});

static SECRET_PAIRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid regex")
});

/// Sanitize error messages before they are retained for status queries
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = URI_USERINFO
        .replace_all(message, "${1}***@")
        .to_string();

    sanitized = SECRET_PAIRS.replace_all(&sanitized, "${1}=***").to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for lifecycle commands
pub type ConnectivityResult<T> = Result<T, ConnectivityError>;
