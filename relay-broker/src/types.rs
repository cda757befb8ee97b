use std::time::Duration;

/// Broker-assigned correlation token for a delivery. Only meaningful on the
/// channel that produced it.
pub type DeliveryTag = u64;

/// One message handed out by the broker, alive until it is acked or rejected.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Terminal decision for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue for good.
    Ack,
    /// Return the message to the queue for redelivery.
    Reject,
}

/// Broker-side names declared on every new connection.
#[derive(Debug, Clone)]
pub struct Topology {
    pub work_queue: String,
    pub result_topic: String,
}

impl Topology {
    pub fn new(work_queue: impl Into<String>, result_topic: impl Into<String>) -> Self {
        Self {
            work_queue: work_queue.into(),
            result_topic: result_topic.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Fixed wait between a lost or failed connection and the next attempt.
    pub delay: Duration,
    /// Consecutive failed attempts before the link gives up. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Upper bound for closing the channel and connection on shutdown.
    pub close_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
            close_timeout: Duration::from_secs(5),
        }
    }
}
