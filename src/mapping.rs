//! Seams to the external mapping pipeline
//!
//! Payload mapping itself lives outside this crate. Consumers hand every
//! inbound [`ExternalMessage`] to an [`InboundProcessor`]; the publisher asks an
//! [`OutboundMapper`] to turn an [`OutboundSignal`] into addressed messages for a
//! target.

use crate::model::{ExternalMessage, InboundOutcome, MappedMessage, OutboundSignal, Source, Target};
use crate::placeholders::{self, PlaceholderContext, PlaceholderError};
use crate::transport::InboundDelivery;
use async_trait::async_trait;
use thiserror::Error;

/// Inbound mapping and dispatch pipeline
#[async_trait]
pub trait InboundProcessor: Send + Sync {
    /// Map and dispatch one message; the outcome decides its settlement
    async fn process(&self, message: ExternalMessage) -> InboundOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("Target address '{address}' cannot be resolved: {cause}")]
    UnresolvableAddress {
        address: String,
        #[source]
        cause: PlaceholderError,
    },
    #[error("Mapping failed: {0}")]
    Failed(String),
}

/// Outbound mapping from signals to broker messages
pub trait OutboundMapper: Send + Sync {
    fn map(
        &self,
        signal: &OutboundSignal,
        target: &Target,
    ) -> Result<Vec<MappedMessage>, MappingError>;
}

/// Pass-through mapper: payload and headers are carried as-is, the target
/// address and header mapping are resolved against the signal
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOutboundMapper;

impl OutboundMapper for DefaultOutboundMapper {
    fn map(
        &self,
        signal: &OutboundSignal,
        target: &Target,
    ) -> Result<Vec<MappedMessage>, MappingError> {
        let ctx = PlaceholderContext::default()
            .with_headers(&signal.headers)
            .with_entity_id(signal.entity_id.as_deref())
            .with_topic(&signal.topic);

        let address = placeholders::resolve(&target.address, &ctx).map_err(|cause| {
            MappingError::UnresolvableAddress {
                address: target.address.clone(),
                cause,
            }
        })?;

        let mut headers = signal.headers.clone();
        headers.extend(placeholders::apply_header_mapping(&target.header_mapping, &ctx));

        let message = ExternalMessage {
            headers,
            payload: signal.payload.clone(),
            content_type: signal.content_type.clone(),
            source_address: None,
            authorization_context: target.authorization_context.clone(),
            acknowledgement_requests: signal.acknowledgement_requests.clone(),
            reply_target: None,
        };

        Ok(vec![MappedMessage { address, message }])
    }
}

/// Build the protocol-neutral message for a raw delivery of `source`
///
/// `address` is the configured source address the consumer was created for,
/// which can differ from the concrete address the broker delivered on.
pub fn to_external_message(
    delivery: &InboundDelivery,
    source: &Source,
    address: &str,
) -> ExternalMessage {
    let mut headers = delivery.headers.clone();
    let mapped = {
        let ctx = PlaceholderContext::default()
            .with_headers(&delivery.headers)
            .with_source_address(address);
        placeholders::apply_header_mapping(&source.header_mapping, &ctx)
    };
    headers.extend(mapped);

    ExternalMessage {
        headers,
        payload: delivery.payload.clone(),
        content_type: delivery.content_type.clone(),
        source_address: Some(address.to_string()),
        authorization_context: source.authorization_context.clone(),
        acknowledgement_requests: source.acknowledgement_requests.clone(),
        reply_target: source.reply_target.clone(),
    }
}

/// Check the source's enforcement against an inbound message
///
/// Passes when no enforcement is configured. Otherwise the resolved input must
/// equal one resolved filter; filters that do not resolve never match.
pub fn check_enforcement(source: &Source, message: &ExternalMessage) -> Result<(), String> {
    let Some(enforcement) = &source.enforcement else {
        return Ok(());
    };

    let mut ctx = PlaceholderContext::default().with_headers(&message.headers);
    if let Some(address) = message.source_address.as_deref() {
        ctx = ctx.with_source_address(address);
    }

    let input = placeholders::resolve(&enforcement.input, &ctx)
        .map_err(|e| format!("enforcement input unresolvable: {e}"))?;

    let matched = enforcement
        .filters
        .iter()
        .filter_map(|filter| placeholders::resolve(filter, &ctx).ok())
        .any(|filter| filter == input);

    if matched {
        Ok(())
    } else {
        Err(format!("enforcement failed: '{input}' matches no filter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Enforcement, HeaderMapping};
    use crate::transport::{Disposition, SettlementToken};
    use crate::error::BrokerError;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    struct NoopSettlement;

    #[async_trait]
    impl SettlementToken for NoopSettlement {
        async fn settle(&self, _disposition: Disposition) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn source() -> Source {
        Source {
            addresses: vec!["telemetry/+".to_string()],
            consumer_count: 1,
            authorization_context: vec!["integration:test".to_string()],
            enforcement: None,
            header_mapping: HeaderMapping::from([(
                "origin".to_string(),
                "{{ source:address }}".to_string(),
            )]),
            reply_target: None,
            acknowledgement_requests: vec!["received".to_string()],
        }
    }

    fn delivery(headers: &[(&str, &str)]) -> InboundDelivery {
        InboundDelivery {
            address: "telemetry/sensor-1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            payload: Bytes::from_static(b"{\"temp\":21}"),
            content_type: Some("application/json".to_string()),
            settlement: Box::new(NoopSettlement),
        }
    }

    fn target(address: &str) -> Target {
        Target {
            address: address.to_string(),
            authorization_context: vec![],
            topics: vec!["*".to_string()],
            header_mapping: HeaderMapping::new(),
        }
    }

    #[test]
    fn test_inbound_message_carries_source_context() {
        let message =
            to_external_message(&delivery(&[("device_id", "d1")]), &source(), "telemetry/+");

        assert_eq!(message.source_address.as_deref(), Some("telemetry/+"));
        assert_eq!(message.header("origin"), Some("telemetry/+"));
        assert_eq!(message.header("device_id"), Some("d1"));
        assert_eq!(message.acknowledgement_requests, vec!["received"]);
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_enforcement() {
        let mut source = source();
        source.enforcement = Some(Enforcement {
            input: "{{ header:device_id }}".to_string(),
            filters: vec!["d1".to_string(), "{{ header:missing }}".to_string()],
        });

        let ok = to_external_message(&delivery(&[("device_id", "d1")]), &source, "telemetry/+");
        assert!(check_enforcement(&source, &ok).is_ok());

        let wrong = to_external_message(&delivery(&[("device_id", "d2")]), &source, "telemetry/+");
        assert!(check_enforcement(&source, &wrong)
            .unwrap_err()
            .contains("matches no filter"));

        let missing = to_external_message(&delivery(&[]), &source, "telemetry/+");
        assert!(check_enforcement(&source, &missing).is_err());
    }

    #[test]
    fn test_default_mapper_resolves_address_and_headers() {
        let mut target = target("events/{{ entity:namespace }}/{{ topic:action }}");
        target.header_mapping =
            BTreeMap::from([("thing".to_string(), "{{ entity:name }}".to_string())]);

        let signal = OutboundSignal::new("s1", "things/events/modified", "{}")
            .with_entity("org.example:lamp")
            .with_ack_request("delivered");

        let mapped = DefaultOutboundMapper.map(&signal, &target).unwrap();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].address, "events/org.example/modified");
        assert_eq!(mapped[0].message.header("thing"), Some("lamp"));
        assert_eq!(mapped[0].message.acknowledgement_requests, vec!["delivered"]);
    }

    #[test]
    fn test_default_mapper_unresolvable_address() {
        let signal = OutboundSignal::new("s1", "events", "{}");
        let err = DefaultOutboundMapper
            .map(&signal, &target("events/{{ entity:id }}"))
            .unwrap_err();
        assert!(matches!(err, MappingError::UnresolvableAddress { .. }));
    }
}
