//! MQTT 5 broker client on top of `rumqttc`
//!
//! One [`MqttConnection`] owns an `AsyncClient` and a driver task polling its
//! event loop. Sessions are sets of subscriptions on that client, consumers
//! are single subscriptions whose deliveries are routed by topic filter, and
//! producers publish to one fixed topic.

use super::options::{
    classify_client_error, classify_connection_error, classify_suback, mqtt_options,
};
use super::router::{release, AckDecision, AckTracker, SubscriptionRouter};
use crate::config::{ReconnectConfig, SpecificConfig};
use crate::error::{BrokerError, BrokerErrorKind};
use crate::model::{Connection, ExternalMessage};
use crate::transport::{
    BrokerClientFactory, BrokerConnection, BrokerConsumer, BrokerProducer, BrokerSession,
    ConnectionEvent, ConnectionListener, Disposition, InboundDelivery, ProducerClosedListener,
    SettlementToken,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long a closing connection waits for its driver to finish
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const SUPPORTED_SCHEMES: &[&str] = &["mqtt", "mqtts", "tcp", "ssl"];

type SubscribeWaiter = (String, oneshot::Sender<Result<(), BrokerError>>);

/// State shared by a connection, its sessions, consumers and producers, and
/// the driver task
struct Shared {
    client: AsyncClient,
    client_id: String,
    listener: ConnectionListener,
    router: Mutex<SubscriptionRouter>,
    acks: Mutex<AckTracker>,
    /// Subscribe requests waiting for their SUBACK, in request order
    subscriptions: Mutex<VecDeque<SubscribeWaiter>>,
    producers: Mutex<HashMap<u64, ProducerClosedListener>>,
    delivering: AtomicBool,
    closing: AtomicBool,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn ack(&self, publish: &Publish) -> Result<(), BrokerError> {
        if publish.qos == QoS::AtMostOnce {
            return Ok(());
        }
        self.client.ack(publish).await.map_err(classify_client_error)
    }

    /// Every producer loses its channel with the connection
    async fn close_producers(&self) {
        let closed: Vec<_> = self.producers.lock().await.drain().collect();
        for (_, on_closed) in closed {
            on_closed(BrokerError::producer_closed("connection to broker lost"));
        }
    }
}

/// Creates MQTT connections
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttClientFactory;

#[async_trait]
impl BrokerClientFactory for MqttClientFactory {
    async fn create_connection(
        &self,
        connection: &Connection,
        config: &SpecificConfig,
        client_id: &str,
        listener: ConnectionListener,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let scheme = connection.uri.split("://").next().unwrap_or_default();
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(BrokerError::protocol(format!(
                "scheme '{scheme}' is not supported by the MQTT client"
            )));
        }

        let options = mqtt_options(config, client_id);
        let (client, event_loop) = AsyncClient::new(options, config.receive_buffer.max(1));

        let shared = Arc::new(Shared {
            client,
            client_id: client_id.to_string(),
            listener,
            router: Mutex::new(SubscriptionRouter::default()),
            acks: Mutex::new(AckTracker::default()),
            subscriptions: Mutex::new(VecDeque::new()),
            producers: Mutex::new(HashMap::new()),
            delivering: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            request_timeout: config.connect_timeout,
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(MqttConnection {
            shared,
            reconnect: config.reconnect.clone(),
            connect_timeout: config.connect_timeout,
            event_loop: Mutex::new(Some(event_loop)),
            shutdown,
            driver: Mutex::new(None),
        }))
    }
}

pub struct MqttConnection {
    shared: Arc<Shared>,
    reconnect: Option<ReconnectConfig>,
    connect_timeout: Duration,
    event_loop: Mutex<Option<EventLoop>>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    /// Start polling and wait for the broker's CONNACK
    async fn start(&self) -> Result<(), BrokerError> {
        let event_loop = self
            .event_loop
            .lock()
            .await
            .take()
            .ok_or_else(|| BrokerError::closed("connection already started"))?;

        let (connected_tx, connected_rx) = oneshot::channel();
        let driver = Driver {
            shared: Arc::clone(&self.shared),
            reconnect: self.reconnect.clone(),
            connected: Some(connected_tx),
            interrupted: false,
            attempts: 0,
        };
        let span = tracing::info_span!("mqtt_driver", client_id = %self.shared.client_id);
        let handle = tokio::spawn(
            driver
                .run(event_loop, self.shutdown.subscribe())
                .instrument(span),
        );
        *self.driver.lock().await = Some(handle);
        self.shared.delivering.store(true, Ordering::SeqCst);

        match tokio::time::timeout(self.connect_timeout, connected_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::closed("event loop stopped before CONNACK")),
            Err(_) => {
                let _ = self.shutdown.send(true);
                Err(BrokerError::new(
                    BrokerErrorKind::Timeout,
                    format!("no CONNACK within {}ms", self.connect_timeout.as_millis()),
                ))
            }
        }
    }

    async fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("connection is closed"));
        }
        Ok(Arc::new(MqttSession {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_id(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Stop routing deliveries; unrouted publishes stay unacknowledged
    async fn stop(&self) -> Result<(), BrokerError> {
        self.shared.delivering.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.delivering.store(false, Ordering::SeqCst);
        self.shared.closing.store(true, Ordering::SeqCst);
        let disconnect = self
            .shared
            .client
            .try_disconnect()
            .map_err(classify_client_error);

        if let Some(mut handle) = self.driver.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
                .await
                .is_err()
            {
                let _ = self.shutdown.send(true);
                handle.abort();
            }
        }
        info!(client_id = %self.shared.client_id, "MQTT connection closed");
        disconnect
    }
}

/// Polls the event loop: routes publishes, resolves SUBACKs and reports
/// interruption and restoration
struct Driver {
    shared: Arc<Shared>,
    reconnect: Option<ReconnectConfig>,
    connected: Option<oneshot::Sender<Result<(), BrokerError>>>,
    interrupted: bool,
    attempts: u32,
}

impl Driver {
    async fn run(mut self, mut event_loop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(packet)) => self.incoming(packet).await,
                Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    if self.shared.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    let cause = classify_connection_error(e);
                    if !self.connection_lost(cause).await {
                        break;
                    }
                    if !self.pace(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // Nobody will answer pending subscriptions any more
        self.shared.subscriptions.lock().await.clear();
        debug!(client_id = %self.shared.client_id, "MQTT driver stopped");
    }

    async fn incoming(&mut self, packet: Packet) {
        match packet {
            Packet::ConnAck(_) => {
                if let Some(connected) = self.connected.take() {
                    info!(client_id = %self.shared.client_id, "Connected to MQTT broker");
                    let _ = connected.send(Ok(()));
                } else if self.interrupted {
                    info!(
                        client_id = %self.shared.client_id,
                        attempts = self.attempts,
                        "MQTT connection restored"
                    );
                    self.interrupted = false;
                    self.attempts = 0;
                    (self.shared.listener)(ConnectionEvent::Restored);
                }
            }
            Packet::Publish(publish) => self.deliver(publish).await,
            Packet::SubAck(suback) => {
                match self.shared.subscriptions.lock().await.pop_front() {
                    Some((address, waiter)) => {
                        let _ = waiter.send(classify_suback(&suback.return_codes, &address));
                    }
                    None => debug!(pkid = suback.pkid, "SUBACK without pending subscribe"),
                }
            }
            Packet::Disconnect(disconnect) => {
                warn!(
                    client_id = %self.shared.client_id,
                    reason = ?disconnect.reason_code,
                    "Broker sent DISCONNECT"
                );
            }
            _ => {}
        }
    }

    async fn deliver(&self, publish: Publish) {
        if !self.shared.delivering.load(Ordering::SeqCst) {
            debug!(pkid = publish.pkid, "Delivery stopped, leaving publish unacknowledged");
            return;
        }

        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        let listeners = self.shared.router.lock().await.route(&topic);
        if listeners.is_empty() {
            debug!(topic = %topic, "No consumer for publish");
            if let Err(e) = self.shared.ack(&publish).await {
                warn!(topic = %topic, error = %e, "Acknowledging unrouted publish failed");
            }
            return;
        }

        let needs_ack = publish.qos != QoS::AtMostOnce;
        if needs_ack {
            self.shared
                .acks
                .lock()
                .await
                .register(publish.pkid, listeners.len());
        }

        let (headers, content_type) = message_properties(publish.properties.as_ref());
        let publish = Arc::new(publish);
        for listener in listeners {
            let delivery = InboundDelivery {
                address: topic.clone(),
                headers: headers.clone(),
                payload: publish.payload.clone(),
                content_type: content_type.clone(),
                settlement: Box::new(MqttSettlement {
                    shared: Arc::clone(&self.shared),
                    publish: needs_ack.then(|| Arc::clone(&publish)),
                }),
            };

            if let Err(delivery) = listener.push(delivery) {
                release(delivery).await;
            }
        }
    }

    /// Returns false when the driver should stop
    async fn connection_lost(&mut self, cause: BrokerError) -> bool {
        if let Some(connected) = self.connected.take() {
            warn!(client_id = %self.shared.client_id, error = %cause, "MQTT connect failed");
            let _ = connected.send(Err(cause));
            return false;
        }

        if !self.interrupted {
            warn!(
                client_id = %self.shared.client_id,
                error = %cause,
                "MQTT connection interrupted"
            );
            self.interrupted = true;
            self.shared.close_producers().await;
            (self.shared.listener)(ConnectionEvent::Interrupted { cause });
        } else {
            debug!(client_id = %self.shared.client_id, error = %cause, "MQTT reconnect failed");
        }

        let Some(reconnect) = &self.reconnect else {
            info!(client_id = %self.shared.client_id, "Failover disabled, not reconnecting");
            return false;
        };
        self.attempts += 1;
        if !reconnect.allows_attempt(self.attempts) {
            warn!(
                client_id = %self.shared.client_id,
                attempts = self.attempts,
                "Giving up reconnecting to MQTT broker"
            );
            return false;
        }
        true
    }

    /// Sleep before the next reconnect; false if shut down meanwhile
    async fn pace(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay_ms = self
            .reconnect
            .as_ref()
            .map_or(0, |r| r.calculate_backoff_delay(self.attempts));
        debug!(attempt = self.attempts, delay_ms, "Reconnecting to MQTT broker");

        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

fn message_properties(
    properties: Option<&PublishProperties>,
) -> (BTreeMap<String, String>, Option<String>) {
    match properties {
        Some(props) => (
            props.user_properties.iter().cloned().collect(),
            props.content_type.clone(),
        ),
        None => (BTreeMap::new(), None),
    }
}

pub struct MqttSession {
    shared: Arc<Shared>,
    id: u64,
    closed: AtomicBool,
}

impl MqttSession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.shared.closing.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("session is closed"));
        }
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.shared.subscriptions.lock().await;
            self.shared
                .client
                .try_subscribe(address, QoS::AtLeastOnce)
                .map_err(classify_client_error)?;
            waiters.push_back((address.to_string(), tx));
        }

        match tokio::time::timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::closed("connection closed before SUBACK")),
            Err(_) => Err(BrokerError::new(
                BrokerErrorKind::Timeout,
                format!("no SUBACK for '{address}'"),
            )),
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn create_consumer(&self, address: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        self.ensure_open()?;
        let consumer_id = self.shared.next_id();
        let first = self
            .shared
            .router
            .lock()
            .await
            .add(consumer_id, self.id, address);

        if first {
            if let Err(e) = self.subscribe(address).await {
                self.shared.router.lock().await.remove(consumer_id);
                return Err(e);
            }
            debug!(address = %address, "Subscribed");
        }

        Ok(Arc::new(MqttConsumer {
            shared: Arc::clone(&self.shared),
            id: consumer_id,
            address: address.to_string(),
        }))
    }

    async fn create_producer(
        &self,
        address: &str,
        on_closed: ProducerClosedListener,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        self.ensure_open()?;
        let id = self.shared.next_id();
        self.shared.producers.lock().await.insert(id, on_closed);
        Ok(Arc::new(MqttProducer {
            shared: Arc::clone(&self.shared),
            id,
            address: address.to_string(),
        }))
    }

    /// Unsubscribe every consumer of this session
    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut router = self.shared.router.lock().await;
        for consumer_id in router.session_consumers(self.id) {
            if let Some(filter) = router.remove(consumer_id) {
                if let Err(e) = self.shared.client.try_unsubscribe(filter) {
                    debug!(error = %e, "Unsubscribe on session close failed");
                }
            }
        }
        Ok(())
    }
}

pub struct MqttConsumer {
    shared: Arc<Shared>,
    id: u64,
    address: String,
}

#[async_trait]
impl BrokerConsumer for MqttConsumer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn set_listener(
        &self,
        listener: tokio::sync::mpsc::Sender<InboundDelivery>,
    ) -> Result<(), BrokerError> {
        if self.shared.router.lock().await.set_listener(self.id, listener) {
            Ok(())
        } else {
            Err(BrokerError::closed(format!(
                "consumer on '{}' is closed",
                self.address
            )))
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let unsubscribe = self.shared.router.lock().await.remove(self.id);
        if let Some(filter) = unsubscribe {
            self.shared
                .client
                .try_unsubscribe(filter)
                .map_err(classify_client_error)?;
        }
        Ok(())
    }
}

pub struct MqttProducer {
    shared: Arc<Shared>,
    id: u64,
    address: String,
}

#[async_trait]
impl BrokerProducer for MqttProducer {
    fn address(&self) -> &str {
        &self.address
    }

    /// Completes once the publish is queued on the client
    async fn send(&self, message: &ExternalMessage) -> Result<(), BrokerError> {
        if !self.shared.producers.lock().await.contains_key(&self.id) {
            return Err(BrokerError::producer_closed(format!(
                "producer for '{}' is closed",
                self.address
            )));
        }

        let properties = PublishProperties {
            content_type: message.content_type.clone(),
            user_properties: message
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };
        let publish = self.shared.client.publish_with_properties(
            self.address.clone(),
            QoS::AtLeastOnce,
            false,
            message.payload.clone(),
            properties,
        );

        match tokio::time::timeout(self.shared.request_timeout, publish).await {
            Ok(result) => result.map_err(classify_client_error),
            Err(_) => Err(BrokerError::new(
                BrokerErrorKind::Timeout,
                format!("publish to '{}' not accepted in time", self.address),
            )),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.producers.lock().await.remove(&self.id);
        Ok(())
    }
}

/// Settles one routed copy of a publish
struct MqttSettlement {
    shared: Arc<Shared>,
    /// `None` for QoS 0 publishes, which are never acknowledged
    publish: Option<Arc<Publish>>,
}

#[async_trait]
impl SettlementToken for MqttSettlement {
    async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        let Some(publish) = &self.publish else {
            return Ok(());
        };

        let decision = self.shared.acks.lock().await.settle(publish.pkid, disposition);
        match decision {
            AckDecision::Ack => self.shared.ack(publish).await,
            AckDecision::Withhold => {
                debug!(pkid = publish.pkid, "Withholding ack for redelivery");
                Ok(())
            }
            AckDecision::Pending => Ok(()),
        }
    }
}
