//! Publisher actor
//!
//! Accepts outbound signals, maps them per target, and sends the resulting
//! messages through per-address producers. Work items pass through a bounded
//! queue of `max_queue_size + parallelism` slots; at most `parallelism` sends
//! are in flight. New items are dropped when the queue is full.
//!
//! Producers are created lazily on first use of an address. When the broker
//! closes one, the address backs off (see [`backoff`]) and its messages are
//! rejected until the window has passed.

pub mod backoff;

use crate::config::PublisherSection;
use crate::error::{BrokerError, BrokerErrorKind};
use crate::mapping::OutboundMapper;
use crate::model::{
    Acknowledgement, ConnectivityStatus, MappedMessage, OutboundSignal, StatusReport, Target,
};
use crate::observability::metrics;
use crate::transport::{BrokerProducer, BrokerSession};
use backoff::{BackoffPolicy, Eligibility, ProducerBackoff};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Reason carried by acknowledgements of dropped messages
pub const QUEUE_FULL_REASON: &str = "message dropped, queue full";

pub enum PublisherCommand {
    Publish(OutboundSignal),
    SessionRecovered(Arc<dyn BrokerSession>),
    Stop,
}

/// Latest per-address producer status
pub type TargetStatuses = BTreeMap<String, StatusReport>;

pub struct PublisherHandle {
    commands: mpsc::UnboundedSender<PublisherCommand>,
    status: watch::Receiver<TargetStatuses>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    pub fn publish(&self, signal: OutboundSignal) -> bool {
        self.commands.send(PublisherCommand::Publish(signal)).is_ok()
    }

    pub fn session_recovered(&self, session: Arc<dyn BrokerSession>) {
        let _ = self.commands.send(PublisherCommand::SessionRecovered(session));
    }

    pub fn statuses(&self) -> TargetStatuses {
        self.status.borrow().clone()
    }

    /// Stop accepting work; sends already in flight are left to complete
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.commands.send(PublisherCommand::Stop);
        self.task
    }
}

pub struct PublisherContext {
    pub connection_id: String,
    pub targets: Vec<Target>,
    pub mapper: Arc<dyn OutboundMapper>,
    pub settings: PublisherSection,
    pub acks: Option<mpsc::UnboundedSender<Acknowledgement>>,
}

struct WorkItem {
    signal: Arc<OutboundSignal>,
    message: MappedMessage,
}

struct SendCompletion {
    item: WorkItem,
    producer_id: u64,
    result: Result<(), BrokerError>,
}

struct ProducerClosed {
    address: String,
    producer_id: u64,
    cause: BrokerError,
}

struct AddressEntry {
    backoff: ProducerBackoff,
    producer: Option<(u64, Arc<dyn BrokerProducer>)>,
}

struct PublisherActor {
    ctx: PublisherContext,
    session: Arc<dyn BrokerSession>,
    policy: BackoffPolicy,
    entries: HashMap<String, AddressEntry>,
    queue: VecDeque<WorkItem>,
    in_flight: usize,
    next_producer_id: u64,
    completions_tx: mpsc::UnboundedSender<SendCompletion>,
    closed_tx: mpsc::UnboundedSender<ProducerClosed>,
    status: watch::Sender<TargetStatuses>,
}

pub fn spawn_publisher(session: Arc<dyn BrokerSession>, ctx: PublisherContext) -> PublisherHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(TargetStatuses::new());

    let span = crate::publisher_span!(ctx.connection_id);
    let policy = BackoffPolicy::new(
        ctx.settings.backoff_initial(),
        ctx.settings.backoff_max(),
    );
    let actor = PublisherActor {
        ctx,
        session,
        policy,
        entries: HashMap::new(),
        queue: VecDeque::new(),
        in_flight: 0,
        next_producer_id: 0,
        completions_tx,
        closed_tx,
        status: status_tx,
    };
    let task = tokio::spawn(
        actor
            .run(commands_rx, completions_rx, closed_rx)
            .instrument(span),
    );

    PublisherHandle {
        commands: commands_tx,
        status: status_rx,
        task,
    }
}

impl PublisherActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PublisherCommand>,
        mut completions: mpsc::UnboundedReceiver<SendCompletion>,
        mut closed: mpsc::UnboundedReceiver<ProducerClosed>,
    ) {
        loop {
            tokio::select! {
                Some(completion) = completions.recv() => {
                    self.complete(completion);
                    self.dispatch().await;
                }
                Some(event) = closed.recv() => {
                    self.producer_closed(event);
                }
                command = commands.recv() => match command {
                    Some(PublisherCommand::Publish(signal)) => {
                        self.publish(signal);
                        self.dispatch().await;
                    }
                    Some(PublisherCommand::SessionRecovered(session)) => {
                        self.session_recovered(session);
                        self.dispatch().await;
                    }
                    Some(PublisherCommand::Stop) | None => break,
                },
            }
        }

        let dropped = self.queue.len();
        for item in std::mem::take(&mut self.queue) {
            self.reject(&item, "publisher stopped");
        }
        info!(dropped, in_flight = self.in_flight, "Publisher stopped");

        while self.in_flight > 0 {
            match completions.recv().await {
                Some(completion) => self.complete(completion),
                None => break,
            }
        }
    }

    fn publish(&mut self, signal: OutboundSignal) {
        let signal = Arc::new(signal);
        let mut mapped = Vec::new();

        for target in self
            .ctx
            .targets
            .iter()
            .filter(|t| t.accepts_topic(&signal.topic))
        {
            match self.ctx.mapper.map(&signal, target) {
                Ok(messages) => mapped.extend(messages),
                Err(e) => {
                    warn!(
                        signal_id = %signal.id,
                        address = %target.address,
                        error = %e,
                        "Dropping unmappable signal"
                    );
                    metrics::metrics().record_publish_failure();
                    self.acknowledge(
                        || Acknowledgement::failed(&signal, &target.address, e.to_string()),
                        &signal,
                    );
                }
            }
        }

        for message in mapped {
            self.enqueue(WorkItem {
                signal: Arc::clone(&signal),
                message,
            });
        }
    }

    fn enqueue(&mut self, item: WorkItem) {
        if self.queue.len() + self.in_flight >= self.ctx.settings.capacity() {
            warn!(
                signal_id = %item.signal.id,
                address = %item.message.address,
                queued = self.queue.len(),
                in_flight = self.in_flight,
                "Publisher queue full, dropping message"
            );
            metrics::metrics().record_queue_full_drop();
            self.reject(&item, QUEUE_FULL_REASON);
            return;
        }
        self.queue.push_back(item);
    }

    /// Start sends until the parallelism limit is reached or the queue is empty
    async fn dispatch(&mut self) {
        while self.in_flight < self.ctx.settings.parallelism {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            let now = Instant::now();
            let address = item.message.address.clone();
            let eligibility = self.entry(&address).backoff.check(now);

            match eligibility {
                Eligibility::Ready { producer_id } => match self.producer(&address, producer_id) {
                    Some(producer) => self.start_send(item, producer_id, producer),
                    None => self.reject(&item, "producer unavailable"),
                },
                Eligibility::Create => match self.create_producer(&address).await {
                    Some((producer_id, producer)) => self.start_send(item, producer_id, producer),
                    None => self.reject(&item, "producer could not be created"),
                },
                Eligibility::Wait(remaining) => {
                    debug!(
                        address = %address,
                        remaining_ms = remaining.as_millis() as u64,
                        "Address backing off"
                    );
                    metrics::metrics().record_backoff_reject();
                    self.reject(
                        &item,
                        &format!(
                            "producer for '{address}' is backing off for another {}ms",
                            remaining.as_millis()
                        ),
                    );
                }
            }
        }
        self.publish_status();
    }

    async fn create_producer(&mut self, address: &str) -> Option<(u64, Arc<dyn BrokerProducer>)> {
        let producer_id = self.next_producer_id;
        self.next_producer_id += 1;

        let closed_tx = self.closed_tx.clone();
        let closed_address = address.to_string();
        let on_closed = Arc::new(move |cause: BrokerError| {
            let _ = closed_tx.send(ProducerClosed {
                address: closed_address.clone(),
                producer_id,
                cause,
            });
        });

        match self.session.create_producer(address, on_closed).await {
            Ok(producer) => {
                debug!(address = %address, producer_id, "Producer created");
                let entry = self.entry(address);
                entry.backoff.activated(producer_id);
                entry.producer = Some((producer_id, Arc::clone(&producer)));
                Some((producer_id, producer))
            }
            Err(e) => {
                let delay = self.entry(address).backoff.creation_failed(Instant::now());
                metrics::metrics().record_producer_backoff();
                warn!(
                    address = %address,
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Producer creation failed, backing off"
                );
                None
            }
        }
    }

    fn start_send(&mut self, item: WorkItem, producer_id: u64, producer: Arc<dyn BrokerProducer>) {
        self.in_flight += 1;
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = producer.send(&item.message.message).await;
            let _ = completions.send(SendCompletion {
                item,
                producer_id,
                result,
            });
        });
    }

    fn complete(&mut self, completion: SendCompletion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let SendCompletion {
            item,
            producer_id,
            result,
        } = completion;
        let address = item.message.address.as_str();

        match result {
            Ok(()) => {
                metrics::metrics().record_message_published();
                self.entry(address).backoff.succeeded(producer_id);
                self.acknowledge(
                    || Acknowledgement::succeeded(&item.signal, address),
                    &item.signal,
                );
            }
            Err(e) => {
                metrics::metrics().record_publish_failure();
                warn!(signal_id = %item.signal.id, address = %address, error = %e, "Send failed");
                if e.kind == BrokerErrorKind::ProducerClosed {
                    self.back_off(address, producer_id, &e);
                }
                let reason = crate::error::sanitize_error_message(&e.to_string());
                self.acknowledge(
                    || Acknowledgement::failed(&item.signal, address, reason),
                    &item.signal,
                );
            }
        }
        self.publish_status();
    }

    fn producer_closed(&mut self, event: ProducerClosed) {
        self.back_off(&event.address, event.producer_id, &event.cause);
        self.publish_status();
    }

    fn back_off(&mut self, address: &str, producer_id: u64, cause: &BrokerError) {
        let entry = self.entry(address);
        match entry.backoff.closed(producer_id, Instant::now()) {
            Some(delay) => {
                entry.producer = None;
                metrics::metrics().record_producer_backoff();
                warn!(
                    address = %address,
                    producer_id,
                    backoff_ms = delay.as_millis() as u64,
                    failures = entry.backoff.consecutive_failures(),
                    cause = %cause,
                    "Producer closed by broker, backing off"
                );
            }
            None => debug!(address = %address, producer_id, "Ignoring close of inactive producer"),
        }
    }

    /// Producers belong to the old session; recreate them on demand
    fn session_recovered(&mut self, session: Arc<dyn BrokerSession>) {
        self.session = session;
        for entry in self.entries.values_mut() {
            entry.producer = None;
            entry.backoff.session_replaced();
        }
        self.publish_status();
    }

    fn entry(&mut self, address: &str) -> &mut AddressEntry {
        let policy = self.policy;
        self.entries
            .entry(address.to_string())
            .or_insert_with(|| AddressEntry {
                backoff: ProducerBackoff::new(policy),
                producer: None,
            })
    }

    fn producer(&self, address: &str, producer_id: u64) -> Option<Arc<dyn BrokerProducer>> {
        self.entries
            .get(address)
            .and_then(|e| e.producer.as_ref())
            .filter(|(id, _)| *id == producer_id)
            .map(|(_, p)| Arc::clone(p))
    }

    fn reject(&self, item: &WorkItem, reason: &str) {
        self.acknowledge(
            || Acknowledgement::failed(&item.signal, &item.message.address, reason),
            &item.signal,
        );
    }

    fn acknowledge(&self, build: impl FnOnce() -> Acknowledgement, signal: &OutboundSignal) {
        if !signal.requests_acknowledgement() {
            return;
        }
        if let Some(acks) = &self.ctx.acks {
            if acks.send(build()).is_err() {
                debug!(signal_id = %signal.id, "Acknowledgement receiver gone");
            }
        }
    }

    fn publish_status(&self) {
        let statuses: TargetStatuses = self
            .entries
            .iter()
            .map(|(address, entry)| {
                let status = entry.backoff.status();
                let details = match status {
                    ConnectivityStatus::Failed => Some(format!(
                        "backing off after {} consecutive producer failures",
                        entry.backoff.consecutive_failures()
                    )),
                    _ => None,
                };
                (address.clone(), (status, details))
            })
            .map(|(address, (status, details))| {
                let previous = self.status.borrow().get(&address).cloned();
                let report = match previous {
                    Some(prev) if prev.status == status && prev.details == details => prev,
                    _ => StatusReport::new(status, details),
                };
                (address, report)
            })
            .collect();

        self.status.send_if_modified(|current| {
            if *current == statuses {
                return false;
            }
            *current = statuses;
            true
        });
    }
}
