//! Classification of broker errors into connectivity statuses

use crate::error::{BrokerError, BrokerErrorKind, ConnectionFailure};
use crate::model::ConnectivityStatus;
use std::error::Error as StdError;

/// Maps a broker error to the status reported for it
pub trait StatusResolver: Send + Sync {
    fn resolve(&self, error: &BrokerError) -> ConnectivityStatus;

    fn resolve_failure(&self, failure: &ConnectionFailure) -> ConnectivityStatus {
        self.resolve(&failure.cause)
    }
}

impl<F> StatusResolver for F
where
    F: Fn(&BrokerError) -> ConnectivityStatus + Send + Sync,
{
    fn resolve(&self, error: &BrokerError) -> ConnectivityStatus {
        self(error)
    }
}

/// Security and authentication rejections, anywhere in the cause chain, are
/// `MISCONFIGURED`; everything else is `FAILED`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStatusResolver;

impl StatusResolver for DefaultStatusResolver {
    fn resolve(&self, error: &BrokerError) -> ConnectivityStatus {
        if is_misconfiguration(error.kind) || chain_has_misconfiguration(error) {
            ConnectivityStatus::Misconfigured
        } else {
            ConnectivityStatus::Failed
        }
    }
}

fn is_misconfiguration(kind: BrokerErrorKind) -> bool {
    kind.is_security() || kind == BrokerErrorKind::InvalidAddress
}

fn chain_has_misconfiguration(error: &BrokerError) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = current {
        if let Some(broker) = cause.downcast_ref::<BrokerError>() {
            if is_misconfiguration(broker.kind) {
                return true;
            }
        }
        current = cause.source();
    }
    false
}
