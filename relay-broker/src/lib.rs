pub mod adapters;
mod consumer;
mod errors;
pub mod in_memory;
mod link;
mod publisher;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use consumer::{Consumer, HandlerError, JobHandler};
pub use errors::BrokerError;
pub use link::{BrokerLink, Session, SessionEnd};
pub use publisher::Publisher;
pub use state::ConnectionState;
pub use types::{Delivery, DeliveryTag, Disposition, ReconnectPolicy, Topology};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Deliveries pushed by the broker for one subscription. The stream ends when
/// the underlying connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens connections to a broker. Implemented by the AMQP adapter and the
/// in-memory broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform one connection handshake and open a channel on it.
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}

/// A channel on a live connection. Operations are issued from the link's own
/// tasks only; implementations are not required to order concurrent calls.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare a durable work queue. Redeclaring with the same parameters is a no-op.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a durable fanout exchange. Redeclaring with the same parameters is a no-op.
    async fn declare_fanout(&self, name: &str) -> Result<(), BrokerError>;

    /// Limit the number of unacknowledged deliveries pushed to this channel.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery and put it back on its queue.
    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Hand a message to the channel's outbound buffer. Does not wait for broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError>;

    /// Resolves once the connection behind this channel is lost, with the reason.
    async fn closed(&self) -> BrokerError;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;
}
