use std::sync::Arc;

use log::{debug, error};
use relay_models::jobs::ResultRecord;

use crate::{BrokerError, BrokerLink};

/// Announces finished jobs on the fanout result topic.
pub struct Publisher {
    link: Arc<BrokerLink>,
    topic: String,
}

impl Publisher {
    pub fn new(link: Arc<BrokerLink>) -> Self {
        let topic = link.topology().result_topic.clone();
        Self { link, topic }
    }

    /// Publish with an empty routing key and the persistent delivery mode.
    /// Returns once the channel accepted the message; there is no broker confirm.
    pub async fn publish(&self, record: &ResultRecord) -> Result<(), BrokerError> {
        let channel = self.link.open_channel()?;
        let payload = record.to_json()?;

        if let Err(err) = channel.publish(&self.topic, "", &payload, true).await {
            error!(
                "Failed to publish result for {} to topic {}: {}",
                record.identifier, self.topic, err
            );
            return Err(err);
        }

        debug!(
            "Message published to topic {}: {}",
            self.topic, record.identifier
        );
        Ok(())
    }
}
