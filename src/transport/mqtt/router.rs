//! Delivery routing and acknowledgement bookkeeping
//!
//! Several consumers may subscribe to overlapping filters; each gets its own
//! copy of a matching publish. The broker is only acked once every copy has
//! been settled, and not at all if any copy asked for redelivery.

use crate::transport::{Disposition, InboundDelivery};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::debug;

/// MQTT topic-filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Strip the `$share/<group>/` prefix of a shared subscription
pub fn effective_filter(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map_or(filter, |(_, filter)| filter)
}

/// Ordered hand-off from the event loop to one consumer
///
/// The event loop never waits for a consumer: deliveries are queued here and
/// a single task feeds them to the consumer's bounded listener in arrival
/// order. Deliveries the consumer can no longer take are released.
#[derive(Clone)]
pub struct DeliveryForwarder {
    queue: mpsc::UnboundedSender<InboundDelivery>,
}

impl DeliveryForwarder {
    /// Spawns the feeding task; it ends once every forwarder clone is dropped
    pub fn spawn(listener: mpsc::Sender<InboundDelivery>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        tokio::spawn(feed(pending, listener));
        Self { queue }
    }

    /// Returns the delivery when the feeding task is gone
    pub fn push(&self, delivery: InboundDelivery) -> Result<(), InboundDelivery> {
        self.queue.send(delivery).map_err(|SendError(delivery)| delivery)
    }
}

async fn feed(
    mut pending: mpsc::UnboundedReceiver<InboundDelivery>,
    listener: mpsc::Sender<InboundDelivery>,
) {
    while let Some(delivery) = pending.recv().await {
        if let Err(SendError(delivery)) = listener.send(delivery).await {
            release(delivery).await;
        }
    }
}

/// Settle a delivery nobody will process so the broker redelivers it
pub async fn release(delivery: InboundDelivery) {
    if let Err(e) = delivery.settlement.settle(Disposition::Released).await {
        debug!(address = %delivery.address, error = %e, "Releasing undeliverable publish failed");
    }
}

struct Route {
    filter: String,
    session_id: u64,
    listener: Option<DeliveryForwarder>,
}

/// Consumers by id, with the filter each one subscribed to
#[derive(Default)]
pub struct SubscriptionRouter {
    routes: HashMap<u64, Route>,
}

impl SubscriptionRouter {
    /// Register a consumer; returns true when the filter had no subscriber yet
    pub fn add(&mut self, consumer_id: u64, session_id: u64, filter: &str) -> bool {
        let first = !self.has_filter(filter);
        self.routes.insert(
            consumer_id,
            Route {
                filter: filter.to_string(),
                session_id,
                listener: None,
            },
        );
        first
    }

    /// Returns false when the consumer is no longer registered
    ///
    /// Deliveries already queued for a replaced listener still reach it.
    pub fn set_listener(
        &mut self,
        consumer_id: u64,
        listener: mpsc::Sender<InboundDelivery>,
    ) -> bool {
        match self.routes.get_mut(&consumer_id) {
            Some(route) => {
                route.listener = Some(DeliveryForwarder::spawn(listener));
                true
            }
            None => false,
        }
    }

    /// Remove a consumer; returns its filter when no other consumer uses it
    pub fn remove(&mut self, consumer_id: u64) -> Option<String> {
        let route = self.routes.remove(&consumer_id)?;
        (!self.has_filter(&route.filter)).then_some(route.filter)
    }

    /// Consumers registered by `session_id`
    pub fn session_consumers(&self, session_id: u64) -> Vec<u64> {
        self.routes
            .iter()
            .filter(|(_, route)| route.session_id == session_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Listeners of every consumer whose filter matches `topic`
    pub fn route(&self, topic: &str) -> Vec<DeliveryForwarder> {
        self.routes
            .values()
            .filter(|route| topic_matches(effective_filter(&route.filter), topic))
            .filter_map(|route| route.listener.clone())
            .collect()
    }

    fn has_filter(&self, filter: &str) -> bool {
        self.routes.values().any(|route| route.filter == filter)
    }
}

/// What to do with the broker delivery after a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Other copies are still being processed
    Pending,
    Ack,
    /// Leave unacknowledged so the broker redelivers
    Withhold,
}

struct PendingAck {
    remaining: usize,
    released: bool,
}

/// Outstanding deliveries by packet id
#[derive(Default)]
pub struct AckTracker {
    pending: HashMap<u16, PendingAck>,
}

impl AckTracker {
    pub fn register(&mut self, pkid: u16, copies: usize) {
        self.pending.insert(
            pkid,
            PendingAck {
                remaining: copies,
                released: false,
            },
        );
    }

    /// Record one copy's settlement
    ///
    /// Rejected copies count as handled; only Released withholds the ack.
    pub fn settle(&mut self, pkid: u16, disposition: Disposition) -> AckDecision {
        let Some(entry) = self.pending.get_mut(&pkid) else {
            return AckDecision::Pending;
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        if disposition == Disposition::Released {
            entry.released = true;
        }
        if entry.remaining > 0 {
            return AckDecision::Pending;
        }

        let released = entry.released;
        self.pending.remove(&pkid);
        if released {
            AckDecision::Withhold
        } else {
            AckDecision::Ack
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::transport::SettlementToken;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct RecordingToken(Arc<Mutex<Vec<Disposition>>>);

    #[async_trait]
    impl SettlementToken for RecordingToken {
        async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push(disposition);
            Ok(())
        }
    }

    fn delivery(seq: usize, settled: &Arc<Mutex<Vec<Disposition>>>) -> InboundDelivery {
        InboundDelivery {
            address: "telemetry".to_string(),
            headers: BTreeMap::new(),
            payload: Bytes::from(seq.to_string()),
            content_type: None,
            settlement: Box::new(RecordingToken(Arc::clone(settled))),
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("devices/+/telemetry", "devices/d1/telemetry"));
        assert!(topic_matches("devices/#", "devices/d1/telemetry"));
        assert!(topic_matches("devices/#", "devices"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("devices/+", "devices/d1/telemetry"));
        assert!(!topic_matches("#", "$SYS/uptime"));
    }

    #[test]
    fn test_shared_subscription_filter() {
        assert_eq!(effective_filter("$share/group/devices/+"), "devices/+");
        assert_eq!(effective_filter("devices/+"), "devices/+");
    }

    #[test]
    fn test_router_counts_filter_subscribers() {
        let mut router = SubscriptionRouter::default();
        assert!(router.add(1, 10, "telemetry"));
        assert!(!router.add(2, 10, "telemetry"));

        assert_eq!(router.remove(1), None);
        assert_eq!(router.remove(2), Some("telemetry".to_string()));
        assert_eq!(router.remove(2), None);
    }

    #[tokio::test]
    async fn test_router_delivers_one_copy_per_consumer() {
        let mut router = SubscriptionRouter::default();
        let (tx, _rx) = mpsc::channel(1);
        router.add(1, 10, "devices/+");
        router.add(2, 10, "devices/d1");
        router.add(3, 11, "other");
        router.set_listener(1, tx.clone());
        router.set_listener(2, tx.clone());
        router.set_listener(3, tx);

        assert_eq!(router.route("devices/d1").len(), 2);
        assert_eq!(router.route("devices/d2").len(), 1);
        assert_eq!(router.session_consumers(10).len(), 2);
    }

    #[tokio::test]
    async fn test_forwarder_keeps_order_when_listener_is_full() {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(1);
        let forwarder = DeliveryForwarder::spawn(tx);

        // Nothing is read until every delivery has been queued
        for seq in 0..50 {
            assert!(forwarder.push(delivery(seq, &settled)).is_ok());
        }
        drop(forwarder);

        let mut received = Vec::new();
        while let Some(delivery) = rx.recv().await {
            received.push(String::from_utf8_lossy(&delivery.payload).parse::<usize>().unwrap());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(received, (0..50).collect::<Vec<_>>());
        assert!(settled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forwarder_releases_when_consumer_is_gone() {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let forwarder = DeliveryForwarder::spawn(tx);

        forwarder.push(delivery(0, &settled)).unwrap();
        forwarder.push(delivery(1, &settled)).unwrap();
        drop(forwarder);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while settled.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *settled.lock().unwrap(),
            vec![Disposition::Released, Disposition::Released]
        );
    }

    #[test]
    fn test_ack_waits_for_every_copy() {
        let mut tracker = AckTracker::default();
        tracker.register(7, 2);

        assert_eq!(tracker.settle(7, Disposition::Accepted), AckDecision::Pending);
        assert_eq!(tracker.settle(7, Disposition::Rejected), AckDecision::Ack);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_any_release_withholds_ack() {
        let mut tracker = AckTracker::default();
        tracker.register(3, 2);

        assert_eq!(tracker.settle(3, Disposition::Released), AckDecision::Pending);
        assert_eq!(tracker.settle(3, Disposition::Accepted), AckDecision::Withhold);
    }
}
