use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use relay_models::errors::SendableError;
use serde::de::DeserializeOwned;

use crate::{BrokerError, BrokerLink, Channel, Delivery, Disposition, Session, SessionEnd};

/// Deliveries a consumer may hold unacknowledged at once.
const PREFETCH: u16 = 1;

pub type HandlerError = SendableError;

/// Processes one decoded job and decides its fate. An `Err` is treated as a
/// transient failure and the message is requeued.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: DeserializeOwned + Send + 'static;

    async fn handle(&self, job: Self::Job) -> Result<Disposition, HandlerError>;
}

/// Pulls jobs from the work queue one at a time and settles each delivery.
pub struct Consumer {
    link: Arc<BrokerLink>,
    queue: String,
    consumer_tag: String,
}

impl Consumer {
    pub fn new(link: Arc<BrokerLink>, consumer_tag: impl Into<String>) -> Self {
        let queue = link.topology().work_queue.clone();
        Self {
            link,
            queue,
            consumer_tag: consumer_tag.into(),
        }
    }

    /// Subscribe once on every new session until the link is closing.
    pub async fn run<H: JobHandler>(&self, handler: Arc<H>) {
        let mut last_session = None;
        while let Some(session) = self.link.wait_for_session(last_session).await {
            last_session = Some(session.id);
            if let Err(err) = self.subscribe_on(&session, &handler).await {
                if self.link.is_closing() {
                    continue;
                }
                if err.is_connection_level() {
                    warn!(
                        "Consumer '{}' lost its subscription on session {}: {}",
                        self.consumer_tag, session.id, err
                    );
                } else {
                    error!(
                        "Consumer '{}' failed on session {}: {}",
                        self.consumer_tag, session.id, err
                    );
                }
                self.link.report_lost(session.id, &err);
            }
        }
        info!("Consumer '{}' stopped", self.consumer_tag);
    }

    /// Consume on the current session until it is lost or shutdown is requested.
    pub async fn subscribe<H: JobHandler>(&self, handler: Arc<H>) -> Result<(), BrokerError> {
        let session = self.link.session().ok_or(BrokerError::ChannelUnavailable)?;
        self.subscribe_on(&session, &handler).await
    }

    async fn subscribe_on<H: JobHandler>(
        &self,
        session: &Session,
        handler: &Arc<H>,
    ) -> Result<(), BrokerError> {
        let channel = session.channel.as_ref();
        channel.prefetch(PREFETCH).await?;
        let mut deliveries = channel.consume(&self.queue, &self.consumer_tag).await?;
        info!("Started consuming from queue: {}", self.queue);

        loop {
            let next = tokio::select! {
                biased;
                end = self.link.session_ended(session.id) => match end {
                    SessionEnd::Shutdown => {
                        info!("Consumer '{}' no longer accepting deliveries", self.consumer_tag);
                        return Ok(());
                    }
                    SessionEnd::Lost => {
                        return Err(BrokerError::Network("session replaced".into()));
                    }
                },
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(channel, delivery, handler).await,
                Some(Err(err)) => return Err(err),
                None => return Err(BrokerError::Network("delivery stream ended".into())),
            }
        }
    }

    pub(crate) async fn process<H: JobHandler>(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
        handler: &Arc<H>,
    ) {
        let tag = delivery.tag;
        let settled = match dispatch(&delivery, handler).await {
            Disposition::Ack => channel.ack(tag).await.map(|_| "acknowledged"),
            Disposition::Reject => channel.requeue(tag).await.map(|_| "requeued"),
        };

        match settled {
            Ok(outcome) => debug!("Delivery {} {}", tag, outcome),
            Err(err) => warn!(
                "Failed to settle delivery {}: {}; the broker will redeliver it",
                tag, err
            ),
        }
    }
}

/// Decode the payload and run the handler. Every path yields exactly one disposition.
pub(crate) async fn dispatch<H: JobHandler>(delivery: &Delivery, handler: &Arc<H>) -> Disposition {
    let job = match serde_json::from_slice::<H::Job>(&delivery.payload) {
        Ok(job) => job,
        Err(err) => {
            // No attempt counter: a permanently malformed message keeps coming back.
            if delivery.redelivered {
                error!(
                    "Malformed payload redelivered (delivery {}), requeueing again: {}",
                    delivery.tag, err
                );
            } else {
                warn!("Malformed payload (delivery {}), requeueing: {}", delivery.tag, err);
            }
            return Disposition::Reject;
        }
    };

    debug!(
        "Received message from queue (delivery {}): {}",
        delivery.tag,
        String::from_utf8_lossy(&delivery.payload)
    );

    let handler = Arc::clone(handler);
    match tokio::spawn(async move { handler.handle(job).await }).await {
        Ok(Ok(disposition)) => disposition,
        Ok(Err(err)) => {
            error!("Error processing message (delivery {}): {}", delivery.tag, err);
            Disposition::Reject
        }
        Err(err) => {
            error!("Handler aborted for delivery {}: {}", delivery.tag, err);
            Disposition::Reject
        }
    }
}
