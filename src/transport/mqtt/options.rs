//! Client options and error classification for the MQTT adapter
//!
//! Pure functions: nothing here touches the network.

use crate::config::SpecificConfig;
use crate::error::{BrokerError, BrokerErrorKind};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, SubscribeReasonCode};
use rumqttc::v5::{ClientError, ConnectionError, MqttOptions};
use rumqttc::Transport as RumqttcTransport;

/// Largest packet the client accepts
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Build client options from resolved broker options
///
/// Acknowledgements are manual: a delivery is only acked once it has been
/// settled by every consumer it was routed to.
pub fn mqtt_options(config: &SpecificConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);

    if config.tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    options.set_keep_alive(config.keep_alive);
    options.set_clean_start(config.clean_start);
    options.set_manual_acks(true);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    options
}

/// Kind of error a refused connection attempt maps to
pub fn classify_connect_code(code: ConnectReturnCode) -> BrokerErrorKind {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::BadAuthenticationMethod => {
            BrokerErrorKind::Authentication
        }
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::Banned => BrokerErrorKind::Security,
        ConnectReturnCode::ClientIdentifierNotValid => BrokerErrorKind::InvalidAddress,
        _ => BrokerErrorKind::Protocol,
    }
}

/// Broker error for a failed event-loop poll
pub fn classify_connection_error(error: ConnectionError) -> BrokerError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            let message = format!("connection refused by broker: {code:?}");
            BrokerError::new(classify_connect_code(code), message)
        }
        ConnectionError::Io(e) => BrokerError::io(e.to_string()).with_source(e),
        other => BrokerError::new(BrokerErrorKind::Protocol, other.to_string()),
    }
}

/// Broker error for a request the client could not queue
pub fn classify_client_error(error: ClientError) -> BrokerError {
    BrokerError::new(BrokerErrorKind::Closed, "mqtt client request queue unavailable")
        .with_source(error)
}

/// Outcome of one subscription acknowledgement
pub fn classify_suback(codes: &[SubscribeReasonCode], address: &str) -> Result<(), BrokerError> {
    for code in codes {
        match code {
            SubscribeReasonCode::Success(_) => {}
            SubscribeReasonCode::NotAuthorized => {
                return Err(BrokerError::security(format!(
                    "not authorized to subscribe to '{address}'"
                )))
            }
            SubscribeReasonCode::TopicFilterInvalid => {
                return Err(BrokerError::new(
                    BrokerErrorKind::InvalidAddress,
                    format!("invalid topic filter '{address}'"),
                ))
            }
            other => {
                return Err(BrokerError::protocol(format!(
                    "subscription to '{address}' refused: {other:?}"
                )))
            }
        }
    }
    Ok(())
}
