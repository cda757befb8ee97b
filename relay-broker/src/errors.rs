use thiserror::Error;

use crate::types::DeliveryTag;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker refused credentials: {0}")]
    Auth(String),
    #[error("broker unreachable: {0}")]
    Network(String),
    #[error("no open channel")]
    ChannelUnavailable,
    #[error("broker link is closing")]
    Closed,
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("delivery not found: {0}")]
    UnknownDelivery(DeliveryTag),
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Faults that end the current session and are recovered by reconnecting.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            BrokerError::Auth(_) | BrokerError::Network(_) | BrokerError::ChannelUnavailable
        )
    }
}
