//! Lifecycle state and externally reported resource status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a connection supervisor
///
/// `MISCONFIGURED` and `FAILED` are not states of their own: they are kept as
/// the retained failure of a `Disconnected` client, which can still be opened
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Testing,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Connecting => "CONNECTING",
            ClientState::Connected => "CONNECTED",
            ClientState::Disconnecting => "DISCONNECTING",
            ClientState::Testing => "TESTING",
        };
        f.write_str(s)
    }
}

/// Health value reported per client, source address and target address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Unknown,
    Open,
    Closed,
    Failing,
    Misconfigured,
    Failed,
}

impl ConnectivityStatus {
    /// Ordering used when several reports collapse into one resource
    pub fn severity(self) -> u8 {
        match self {
            ConnectivityStatus::Open => 0,
            ConnectivityStatus::Unknown => 1,
            ConnectivityStatus::Closed => 2,
            ConnectivityStatus::Failing => 3,
            ConnectivityStatus::Failed => 4,
            ConnectivityStatus::Misconfigured => 5,
        }
    }

    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityStatus::Unknown => "unknown",
            ConnectivityStatus::Open => "open",
            ConnectivityStatus::Closed => "closed",
            ConnectivityStatus::Failing => "failing",
            ConnectivityStatus::Misconfigured => "misconfigured",
            ConnectivityStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Client,
    Source,
    Target,
}

/// One status record per (resource type, resource id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_type: ResourceType,
    pub client_id: String,
    /// Source or target address, `None` for the client itself
    pub address: Option<String>,
    pub status: ConnectivityStatus,
    pub status_details: Option<String>,
    pub in_state_since: DateTime<Utc>,
}

/// A status value together with when it was last replaced
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: ConnectivityStatus,
    pub details: Option<String>,
    pub since: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(status: ConnectivityStatus, details: Option<String>) -> Self {
        Self {
            status,
            details,
            since: Utc::now(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(ConnectivityStatus::Unknown, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_prefers_higher_severity() {
        use ConnectivityStatus::*;
        assert_eq!(Open.worst(Failed), Failed);
        assert_eq!(Misconfigured.worst(Failed), Misconfigured);
        assert_eq!(Unknown.worst(Open), Unknown);
        assert_eq!(Closed.worst(Closed), Closed);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ConnectivityStatus::Misconfigured).unwrap();
        assert_eq!(json, "\"misconfigured\"");
        let json = serde_json::to_string(&ClientState::Disconnecting).unwrap();
        assert_eq!(json, "\"DISCONNECTING\"");
    }
}
