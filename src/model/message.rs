//! Message shapes crossing the mapping pipeline boundary

use crate::model::connection::ReplyTarget;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol-neutral representation of a broker message
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExternalMessage {
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
    pub content_type: Option<String>,
    /// Address the message was consumed from (inbound only)
    pub source_address: Option<String>,
    pub authorization_context: Vec<String>,
    pub acknowledgement_requests: Vec<String>,
    pub reply_target: Option<ReplyTarget>,
}

impl ExternalMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// An outbound message after mapping, bound for a resolved address
#[derive(Debug, Clone, PartialEq)]
pub struct MappedMessage {
    pub address: String,
    pub message: ExternalMessage,
}

/// Result of handing an inbound message to the mapping pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Application signals were produced and dispatched
    Processed { signal_count: usize },
    /// Processing produced an application-level response
    Responded,
    /// Redelivery cannot help, e.g. a malformed payload
    Rejected { reason: String },
    /// Redelivery may succeed, e.g. downstream timeout or backpressure
    TransientFailure { reason: String },
}

/// Application signal handed to the publisher
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub id: String,
    /// Signal topic matched against [`crate::model::Target::topics`]
    pub topic: String,
    /// Entity the signal is about, formatted `namespace:name`
    pub entity_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
    pub content_type: Option<String>,
    /// Labels the sender wants acknowledged
    pub acknowledgement_requests: Vec<String>,
}

impl OutboundSignal {
    pub fn new(id: impl Into<String>, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            entity_id: None,
            headers: BTreeMap::new(),
            payload: payload.into(),
            content_type: None,
            acknowledgement_requests: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_ack_request(mut self, label: impl Into<String>) -> Self {
        self.acknowledgement_requests.push(label.into());
        self
    }

    pub fn requests_acknowledgement(&self) -> bool {
        !self.acknowledgement_requests.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Succeeded,
    Failed,
}

/// Acknowledgement correlated to the signal that requested it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub signal_id: String,
    pub labels: Vec<String>,
    pub address: String,
    pub status: AckStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Acknowledgement {
    pub fn succeeded(signal: &OutboundSignal, address: &str) -> Self {
        Self {
            signal_id: signal.id.clone(),
            labels: signal.acknowledgement_requests.clone(),
            address: address.to_string(),
            status: AckStatus::Succeeded,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(signal: &OutboundSignal, address: &str, reason: impl Into<String>) -> Self {
        Self {
            signal_id: signal.id.clone(),
            labels: signal.acknowledgement_requests.clone(),
            address: address.to_string(),
            status: AckStatus::Failed,
            reason: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Succeeded
    }
}
