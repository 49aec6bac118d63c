//! Mock implementations for testing
//!
//! [`MockBroker`] implements every broker boundary trait in memory: it counts
//! each call, can fail any operation on demand, holds sends behind a gate,
//! injects deliveries, and triggers interruption, restoration and
//! producer-closed events. [`MockInboundProcessor`] stands in for the inbound
//! mapping pipeline.

use crate::config::SpecificConfig;
use crate::error::{BrokerError, BrokerErrorKind};
use crate::mapping::InboundProcessor;
use crate::model::{Acknowledgement, Connection, ExternalMessage, InboundOutcome};
use crate::transport::{
    BrokerClientFactory, BrokerConnection, BrokerConsumer, BrokerProducer, BrokerSession,
    ConnectionEvent, ConnectionListener, Disposition, InboundDelivery, ProducerClosedListener,
    SettlementToken,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};

/// Broker operations a test can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    CreateConnection,
    Start,
    CreateSession,
    CreateConsumer,
    SetListener,
    CreateProducer,
    Send,
}

/// Snapshot of how often each broker operation was called
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockCounts {
    pub connections_created: usize,
    pub starts: usize,
    pub stops: usize,
    pub connections_closed: usize,
    pub sessions_created: usize,
    pub sessions_closed: usize,
    pub consumers_created: usize,
    pub consumers_closed: usize,
    pub listeners_installed: usize,
    pub producers_created: usize,
    pub producers_closed: usize,
    pub sends: usize,
}

impl MockCounts {
    /// Every broker call of any kind
    pub fn total(&self) -> usize {
        self.connections_created
            + self.starts
            + self.stops
            + self.connections_closed
            + self.sessions_created
            + self.sessions_closed
            + self.consumers_created
            + self.consumers_closed
            + self.listeners_installed
            + self.producers_created
            + self.producers_closed
            + self.sends
    }
}

#[derive(Default)]
struct Counters {
    connections_created: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    connections_closed: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_closed: AtomicUsize,
    consumers_created: AtomicUsize,
    consumers_closed: AtomicUsize,
    listeners_installed: AtomicUsize,
    producers_created: AtomicUsize,
    producers_closed: AtomicUsize,
    sends: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// A message the mock broker accepted from a producer
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub address: String,
    pub message: ExternalMessage,
}

struct ConsumerRecord {
    id: u64,
    connection_id: u64,
    session_id: u64,
    address: String,
    listener: Option<mpsc::Sender<InboundDelivery>>,
    active: bool,
}

struct ProducerRecord {
    id: u64,
    address: String,
    on_closed: ProducerClosedListener,
    active: bool,
}

#[derive(Default)]
struct BrokerState {
    counters: Counters,
    next_id: AtomicU64,
    /// One-shot failures, consumed in order
    scripted: Mutex<HashMap<MockOperation, VecDeque<BrokerError>>>,
    /// Failures repeated on every call until cleared
    persistent: Mutex<HashMap<MockOperation, BrokerErrorKind>>,
    connect_delay: Mutex<Option<Duration>>,
    listener: Mutex<Option<ConnectionListener>>,
    consumers: Mutex<Vec<ConsumerRecord>>,
    producers: Mutex<Vec<ProducerRecord>>,
    send_gate: Mutex<Option<Arc<Semaphore>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
    client_ids: Mutex<Vec<String>>,
}

/// In-memory broker implementing the broker client boundary
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// This broker as a client factory for supervisors
    pub fn factory(&self) -> Arc<dyn BrokerClientFactory> {
        Arc::new(self.clone())
    }

    pub fn counts(&self) -> MockCounts {
        let c = &self.state.counters;
        let get = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        MockCounts {
            connections_created: get(&c.connections_created),
            starts: get(&c.starts),
            stops: get(&c.stops),
            connections_closed: get(&c.connections_closed),
            sessions_created: get(&c.sessions_created),
            sessions_closed: get(&c.sessions_closed),
            consumers_created: get(&c.consumers_created),
            consumers_closed: get(&c.consumers_closed),
            listeners_installed: get(&c.listeners_installed),
            producers_created: get(&c.producers_created),
            producers_closed: get(&c.producers_closed),
            sends: get(&c.sends),
        }
    }

    /// Fail the next call of `operation` with `error`
    pub async fn fail_next(&self, operation: MockOperation, error: BrokerError) {
        self.state
            .scripted
            .lock()
            .await
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `operation` until [`Self::clear_failures`]
    pub async fn fail_always(&self, operation: MockOperation, kind: BrokerErrorKind) {
        self.state.persistent.lock().await.insert(operation, kind);
    }

    pub async fn clear_failures(&self) {
        self.state.scripted.lock().await.clear();
        self.state.persistent.lock().await.clear();
    }

    /// Delay connection creation, e.g. to trigger supervisor timeouts
    pub async fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock().await = delay;
    }

    /// Hold every send until released with [`Self::release_sends`]
    pub async fn gate_sends(&self) {
        *self.state.send_gate.lock().await = Some(Arc::new(Semaphore::new(0)));
    }

    pub async fn release_sends(&self, count: usize) {
        if let Some(gate) = self.state.send_gate.lock().await.as_ref() {
            gate.add_permits(count);
        }
    }

    /// Remove the gate and let every held send through
    pub async fn open_send_gate(&self) {
        if let Some(gate) = self.state.send_gate.lock().await.take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().await.clone()
    }

    /// Broker client ids used by every connection created so far
    pub async fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().await.clone()
    }

    /// Consumers on live sessions with an installed listener
    pub async fn active_consumers(&self, address: &str) -> usize {
        self.state
            .consumers
            .lock()
            .await
            .iter()
            .filter(|c| c.active && c.address == address && c.listener.is_some())
            .count()
    }

    /// Deliver one message to every active consumer of `address`
    ///
    /// Returns one watch per consumer copy to observe its settlement.
    pub async fn deliver(&self, address: &str, payload: impl Into<Bytes>) -> Vec<SettlementWatch> {
        self.deliver_with_headers(address, BTreeMap::new(), payload)
            .await
    }

    pub async fn deliver_with_headers(
        &self,
        address: &str,
        headers: BTreeMap<String, String>,
        payload: impl Into<Bytes>,
    ) -> Vec<SettlementWatch> {
        let payload = payload.into();
        let listeners: Vec<_> = self
            .state
            .consumers
            .lock()
            .await
            .iter()
            .filter(|c| c.active && c.address == address)
            .filter_map(|c| c.listener.clone())
            .collect();

        let mut watches = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let settlement = MockSettlement::new();
            let watch = settlement.watch();
            let delivery = InboundDelivery {
                address: address.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
                content_type: Some("application/json".to_string()),
                settlement: Box::new(settlement),
            };
            if listener.send(delivery).await.is_ok() {
                watches.push(watch);
            }
        }
        watches
    }

    /// Signal a lost connection to the latest connection's listener
    pub async fn interrupt(&self, cause: BrokerError) {
        if let Some(listener) = self.state.listener.lock().await.as_ref() {
            listener(ConnectionEvent::Interrupted { cause });
        }
    }

    pub async fn restore(&self) {
        if let Some(listener) = self.state.listener.lock().await.as_ref() {
            listener(ConnectionEvent::Restored);
        }
    }

    /// Close every active producer of `address` from the broker side
    ///
    /// Returns how many producers were closed.
    pub async fn close_producer(&self, address: &str) -> usize {
        let closed: Vec<ProducerClosedListener> = {
            let mut producers = self.state.producers.lock().await;
            producers
                .iter_mut()
                .filter(|p| p.active && p.address == address)
                .map(|p| {
                    p.active = false;
                    Arc::clone(&p.on_closed)
                })
                .collect()
        };
        for on_closed in &closed {
            on_closed(BrokerError::producer_closed(format!(
                "broker closed link to '{address}'"
            )));
        }
        closed.len()
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn check_failure(&self, operation: MockOperation) -> Result<(), BrokerError> {
        if let Some(error) = self
            .state
            .scripted
            .lock()
            .await
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(kind) = self.state.persistent.lock().await.get(&operation) {
            return Err(BrokerError::new(
                *kind,
                format!("mock failure of {operation:?}"),
            ));
        }
        Ok(())
    }

    async fn deactivate_consumers(&self, matches: impl Fn(&ConsumerRecord) -> bool) {
        for consumer in self.state.consumers.lock().await.iter_mut() {
            if matches(consumer) {
                consumer.active = false;
                consumer.listener = None;
            }
        }
    }
}

#[async_trait]
impl BrokerClientFactory for MockBroker {
    async fn create_connection(
        &self,
        _connection: &Connection,
        _config: &SpecificConfig,
        client_id: &str,
        listener: ConnectionListener,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let delay = *self.state.connect_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        bump(&self.state.counters.connections_created);
        self.check_failure(MockOperation::CreateConnection).await?;

        self.state.client_ids.lock().await.push(client_id.to_string());
        *self.state.listener.lock().await = Some(listener);
        Ok(Arc::new(MockConnection {
            broker: self.clone(),
            id: self.next_id(),
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn start(&self) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.starts);
        self.broker.check_failure(MockOperation::Start).await
    }

    async fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        bump(&self.broker.state.counters.sessions_created);
        self.broker
            .check_failure(MockOperation::CreateSession)
            .await?;
        Ok(Arc::new(MockSession {
            broker: self.broker.clone(),
            connection_id: self.id,
            id: self.broker.next_id(),
        }))
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.stops);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.connections_closed);
        let id = self.id;
        self.broker
            .deactivate_consumers(|c| c.connection_id == id)
            .await;
        Ok(())
    }
}

struct MockSession {
    broker: MockBroker,
    connection_id: u64,
    id: u64,
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn create_consumer(&self, address: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        bump(&self.broker.state.counters.consumers_created);
        self.broker
            .check_failure(MockOperation::CreateConsumer)
            .await?;

        let id = self.broker.next_id();
        self.broker.state.consumers.lock().await.push(ConsumerRecord {
            id,
            connection_id: self.connection_id,
            session_id: self.id,
            address: address.to_string(),
            listener: None,
            active: true,
        });
        Ok(Arc::new(MockConsumer {
            broker: self.broker.clone(),
            id,
            address: address.to_string(),
        }))
    }

    async fn create_producer(
        &self,
        address: &str,
        on_closed: ProducerClosedListener,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        bump(&self.broker.state.counters.producers_created);
        self.broker
            .check_failure(MockOperation::CreateProducer)
            .await?;

        let id = self.broker.next_id();
        self.broker.state.producers.lock().await.push(ProducerRecord {
            id,
            address: address.to_string(),
            on_closed,
            active: true,
        });
        Ok(Arc::new(MockProducer {
            broker: self.broker.clone(),
            id,
            address: address.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.sessions_closed);
        let id = self.id;
        self.broker.deactivate_consumers(|c| c.session_id == id).await;
        Ok(())
    }
}

struct MockConsumer {
    broker: MockBroker,
    id: u64,
    address: String,
}

#[async_trait]
impl BrokerConsumer for MockConsumer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn set_listener(
        &self,
        listener: mpsc::Sender<InboundDelivery>,
    ) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.listeners_installed);
        self.broker.check_failure(MockOperation::SetListener).await?;

        let mut consumers = self.broker.state.consumers.lock().await;
        match consumers.iter_mut().find(|c| c.id == self.id && c.active) {
            Some(record) => {
                record.listener = Some(listener);
                Ok(())
            }
            None => Err(BrokerError::closed(format!(
                "consumer on '{}' is closed",
                self.address
            ))),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.consumers_closed);
        let id = self.id;
        self.broker.deactivate_consumers(|c| c.id == id).await;
        Ok(())
    }
}

struct MockProducer {
    broker: MockBroker,
    id: u64,
    address: String,
}

impl MockProducer {
    async fn is_active(&self) -> bool {
        self.broker
            .state
            .producers
            .lock()
            .await
            .iter()
            .any(|p| p.id == self.id && p.active)
    }
}

#[async_trait]
impl BrokerProducer for MockProducer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, message: &ExternalMessage) -> Result<(), BrokerError> {
        let state = &self.broker.state;
        bump(&state.counters.sends);
        let now_in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let gate = state.send_gate.lock().await.clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = match self.broker.check_failure(MockOperation::Send).await {
            Err(e) => Err(e),
            Ok(()) if !self.is_active().await => Err(BrokerError::producer_closed(format!(
                "producer for '{}' is closed",
                self.address
            ))),
            Ok(()) => {
                state.sent.lock().await.push(SentMessage {
                    address: self.address.clone(),
                    message: message.clone(),
                });
                Ok(())
            }
        };

        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) -> Result<(), BrokerError> {
        bump(&self.broker.state.counters.producers_closed);
        for producer in self.broker.state.producers.lock().await.iter_mut() {
            if producer.id == self.id {
                producer.active = false;
            }
        }
        Ok(())
    }
}

/// Records every disposition it is settled with
pub struct MockSettlement {
    dispositions: Arc<Mutex<Vec<Disposition>>>,
}

impl MockSettlement {
    pub fn new() -> Self {
        Self {
            dispositions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn watch(&self) -> SettlementWatch {
        SettlementWatch {
            dispositions: Arc::clone(&self.dispositions),
        }
    }
}

impl Default for MockSettlement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementToken for MockSettlement {
    async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        self.dispositions.lock().await.push(disposition);
        Ok(())
    }
}

/// Observes the settlements of one delivered message
#[derive(Clone)]
pub struct SettlementWatch {
    dispositions: Arc<Mutex<Vec<Disposition>>>,
}

impl SettlementWatch {
    pub async fn dispositions(&self) -> Vec<Disposition> {
        self.dispositions.lock().await.clone()
    }

    /// First settlement, waiting up to `timeout` for it
    pub async fn settled(&self, timeout: Duration) -> Option<Disposition> {
        let dispositions = Arc::clone(&self.dispositions);
        wait_until(timeout, || {
            let dispositions = Arc::clone(&dispositions);
            async move { !dispositions.lock().await.is_empty() }
        })
        .await;
        self.dispositions.lock().await.first().copied()
    }
}

type OutcomeFn = dyn Fn(&ExternalMessage) -> InboundOutcome + Send + Sync;

/// Inbound pipeline that records messages and answers with a chosen outcome
#[derive(Clone)]
pub struct MockInboundProcessor {
    outcome: Arc<OutcomeFn>,
    delay: Option<Duration>,
    received: Arc<Mutex<Vec<ExternalMessage>>>,
}

impl MockInboundProcessor {
    /// Accepts everything as one produced signal
    pub fn new() -> Self {
        Self::with_outcome(InboundOutcome::Processed { signal_count: 1 })
    }

    pub fn with_outcome(outcome: InboundOutcome) -> Self {
        Self::with_fn(move |_| outcome.clone())
    }

    pub fn with_fn(
        outcome: impl Fn(&ExternalMessage) -> InboundOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            outcome: Arc::new(outcome),
            delay: None,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn received(&self) -> Vec<ExternalMessage> {
        self.received.lock().await.clone()
    }
}

impl Default for MockInboundProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboundProcessor for MockInboundProcessor {
    async fn process(&self, message: ExternalMessage) -> InboundOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = (self.outcome)(&message);
        self.received.lock().await.push(message);
        outcome
    }
}

/// Collects acknowledgements emitted by publishers
pub struct AcknowledgementSink {
    rx: mpsc::UnboundedReceiver<Acknowledgement>,
    received: Vec<Acknowledgement>,
}

impl AcknowledgementSink {
    /// A sink and the sender to hand to supervisors
    pub fn channel() -> (Self, mpsc::UnboundedSender<Acknowledgement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                received: Vec::new(),
            },
            tx,
        )
    }

    /// Everything received so far, without waiting
    pub fn drain(&mut self) -> &[Acknowledgement] {
        while let Ok(ack) = self.rx.try_recv() {
            self.received.push(ack);
        }
        &self.received
    }

    /// Wait until at least `count` acknowledgements arrived
    pub async fn wait_for(&mut self, count: usize, timeout: Duration) -> &[Acknowledgement] {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.received.len() < count {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(ack)) => self.received.push(ack),
                Ok(None) | Err(_) => break,
            }
        }
        &self.received
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
