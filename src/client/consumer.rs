//! Consumer actor: one per (source address × consumer index)
//!
//! Owns one broker consumer handle, turns its raw deliveries into
//! [`ExternalMessage`](crate::model::ExternalMessage)s, hands them to the
//! inbound processor and settles each delivery exactly once according to the
//! outcome. Listener installation failures are classified: security problems
//! make the consumer `MISCONFIGURED`, anything else asks the supervisor for a
//! fresh session a bounded number of times.

use crate::client::messages::SupervisorMessage;
use crate::client::resolver::StatusResolver;
use crate::mapping::{self, InboundProcessor};
use crate::model::{ConnectivityStatus, ConsumerKey, InboundOutcome, Source, StatusReport};
use crate::observability::metrics;
use crate::transport::{BrokerConsumer, Disposition, InboundDelivery};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Deliveries buffered between the broker client and the consumer actor
const DELIVERY_BUFFER: usize = 64;

pub enum ConsumerCommand {
    /// Swap in the handle created on a recovered session
    Replace(Arc<dyn BrokerConsumer>),
    Stop,
}

/// Settlement for a processing outcome (pure function)
pub fn disposition_for(outcome: &InboundOutcome) -> Disposition {
    match outcome {
        InboundOutcome::Processed { .. } | InboundOutcome::Responded => Disposition::Accepted,
        InboundOutcome::Rejected { .. } => Disposition::Rejected,
        InboundOutcome::TransientFailure { .. } => Disposition::Released,
    }
}

/// Supervisor-side handle of a running consumer actor
pub struct ConsumerHandle {
    key: ConsumerKey,
    commands: mpsc::UnboundedSender<ConsumerCommand>,
    status: watch::Receiver<StatusReport>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn replace(&self, handle: Arc<dyn BrokerConsumer>) {
        if self.commands.send(ConsumerCommand::Replace(handle)).is_err() {
            debug!(consumer = %self.key, "Consumer already stopped, dropping replacement");
        }
    }

    /// Stop processing; the actor exits after the delivery in progress
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.commands.send(ConsumerCommand::Stop);
        self.task
    }
}

/// Dependencies shared by every consumer of one supervisor
#[derive(Clone)]
pub struct ConsumerContext {
    pub connection_id: String,
    pub processor: Arc<dyn InboundProcessor>,
    pub resolver: Arc<dyn StatusResolver>,
    pub supervisor: mpsc::WeakUnboundedSender<SupervisorMessage>,
    pub max_recovery_attempts: u32,
}

struct ConsumerActor {
    key: ConsumerKey,
    source: Arc<Source>,
    handle: Arc<dyn BrokerConsumer>,
    ctx: ConsumerContext,
    deliveries_tx: mpsc::Sender<InboundDelivery>,
    status: watch::Sender<StatusReport>,
    failed_installs: u32,
}

/// Spawn a consumer actor for `handle`
pub fn spawn_consumer(
    key: ConsumerKey,
    source: Arc<Source>,
    handle: Arc<dyn BrokerConsumer>,
    ctx: ConsumerContext,
) -> ConsumerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_BUFFER);
    let (status_tx, status_rx) = watch::channel(StatusReport::unknown());

    let span = crate::consumer_span!(ctx.connection_id, key.address, key.index);
    let actor = ConsumerActor {
        key: key.clone(),
        source,
        handle,
        ctx,
        deliveries_tx,
        status: status_tx,
        failed_installs: 0,
    };
    let task = tokio::spawn(actor.run(commands_rx, deliveries_rx).instrument(span));

    ConsumerHandle {
        key,
        commands: commands_tx,
        status: status_rx,
        task,
    }
}

impl ConsumerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ConsumerCommand>,
        mut deliveries: mpsc::Receiver<InboundDelivery>,
    ) {
        self.install_listener().await;

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(ConsumerCommand::Replace(handle)) => {
                        debug!(consumer = %self.key, "Replacing consumer handle");
                        self.handle = handle;
                        self.install_listener().await;
                    }
                    Some(ConsumerCommand::Stop) | None => break,
                },
                Some(delivery) = deliveries.recv() => {
                    self.handle_delivery(delivery).await;
                }
            }
        }

        self.set_status(ConnectivityStatus::Closed, None);
        debug!(consumer = %self.key, "Consumer stopped");
    }

    async fn install_listener(&mut self) {
        let result = self.handle.set_listener(self.deliveries_tx.clone()).await;
        let error = match result {
            Ok(()) => {
                self.failed_installs = 0;
                self.set_status(ConnectivityStatus::Open, Some("consumer started".to_string()));
                info!(consumer = %self.key, "Consumer listening");
                return;
            }
            Err(e) => e,
        };

        let details = crate::error::sanitize_error_message(&error.to_string());
        if self.ctx.resolver.resolve(&error) == ConnectivityStatus::Misconfigured {
            warn!(consumer = %self.key, error = %details, "Consumer misconfigured");
            self.set_status(ConnectivityStatus::Misconfigured, Some(details));
            return;
        }

        self.failed_installs += 1;
        if self.failed_installs > self.ctx.max_recovery_attempts {
            warn!(
                consumer = %self.key,
                attempts = self.failed_installs,
                error = %details,
                "Giving up on consumer"
            );
            self.set_status(
                ConnectivityStatus::Failed,
                Some(format!(
                    "listener installation failed {} times: {details}",
                    self.failed_installs
                )),
            );
            return;
        }

        warn!(
            consumer = %self.key,
            attempt = self.failed_installs,
            error = %details,
            "Listener installation failed, requesting session recovery"
        );
        self.set_status(ConnectivityStatus::Failing, Some(details));
        if let Some(supervisor) = self.ctx.supervisor.upgrade() {
            let _ = supervisor.send(SupervisorMessage::ConsumerFailed {
                key: self.key.clone(),
                cause: error,
            });
        }
    }

    async fn handle_delivery(&self, delivery: InboundDelivery) {
        metrics::metrics().record_message_consumed();
        let message = mapping::to_external_message(&delivery, &self.source, &self.key.address);

        let outcome = match mapping::check_enforcement(&self.source, &message) {
            Ok(()) => self.ctx.processor.process(message).await,
            Err(reason) => InboundOutcome::Rejected { reason },
        };

        let disposition = disposition_for(&outcome);
        if let InboundOutcome::Rejected { reason } | InboundOutcome::TransientFailure { reason } =
            &outcome
        {
            debug!(consumer = %self.key, ?disposition, reason = %reason, "Message not accepted");
        }

        match delivery.settlement.settle(disposition).await {
            Ok(()) => metrics::metrics().record_settlement(disposition),
            Err(e) => warn!(
                consumer = %self.key,
                ?disposition,
                error = %e,
                "Settling message failed"
            ),
        }
    }

    fn set_status(&self, status: ConnectivityStatus, details: Option<String>) {
        self.status.send_if_modified(|current| {
            if current.status == status && current.details == details {
                return false;
            }
            *current = StatusReport::new(status, details);
            true
        });
    }
}
