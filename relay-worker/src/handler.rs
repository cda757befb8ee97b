use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use relay_broker::{Disposition, HandlerError, JobHandler, Publisher};
use relay_database::{CompletionStore, StoreError};
use relay_models::jobs::{NOTIFICATION_TITLE, NotificationJob, ResultRecord};
use relay_utilities::logger::redact_token;

use crate::notifier::NotificationSender;

/// Sends the push notification for a job, records its completion and announces
/// the result. Downstream failures requeue the job; a completion that was
/// already recorded counts as done.
pub struct NotificationHandler<C: CompletionStore> {
    sender: Arc<dyn NotificationSender>,
    store: Arc<C>,
    publisher: Publisher,
}

impl<C: CompletionStore> NotificationHandler<C> {
    pub fn new(sender: Arc<dyn NotificationSender>, store: Arc<C>, publisher: Publisher) -> Self {
        Self {
            sender,
            store,
            publisher,
        }
    }
}

#[async_trait]
impl<C: CompletionStore> JobHandler for NotificationHandler<C> {
    type Job = NotificationJob;

    async fn handle(&self, job: NotificationJob) -> Result<Disposition, HandlerError> {
        if let Some(reason) = job.invalid_reason() {
            warn!("Invalid message format ({}), dropping job '{}'", reason, job.identifier);
            return Ok(Disposition::Ack);
        }
        info!("Processing FCM message: {}", job.identifier);

        if let Err(err) = self
            .sender
            .send(&job.device_id, NOTIFICATION_TITLE, &job.text)
            .await
        {
            error!(
                "Failed to send notification for {} to {}: {}",
                job.identifier,
                redact_token(&job.device_id),
                err
            );
            return Ok(Disposition::Reject);
        }

        let deliver_at = Utc::now();
        match self.store.record_completion(&job.identifier, deliver_at).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                warn!(
                    "Completion for {} already recorded, announcing result again",
                    job.identifier
                );
            }
            Err(err) => {
                error!("Failed to record completion for {}: {}", job.identifier, err);
                return Ok(Disposition::Reject);
            }
        }

        let record = ResultRecord::new(job.identifier.as_str(), deliver_at);
        if let Err(err) = self.publisher.publish(&record).await {
            error!("Failed to publish result for {}: {}", job.identifier, err);
            return Ok(Disposition::Reject);
        }

        info!(
            "FCM notification processed successfully: {} delivered at {}",
            record.identifier, record.deliver_at
        );
        Ok(Disposition::Ack)
    }
}
