use crate::{BrokerError, Channel, Delivery, DeliveryStream, DeliveryTag, Transport};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch};

/// Most recent publishes kept for inspection; older ones are forgotten.
pub const PUBLISHED_HISTORY: usize = 256;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Inflight {
    queue: String,
    message: StoredMessage,
    connection: u64,
}

/// A message handed to `Channel::publish`, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: u32,
    pub refused_connections: u32,
    pub subscriptions: u32,
    pub acks: u32,
    pub requeues: u32,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    exchanges: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    inflight: HashMap<DeliveryTag, Inflight>,
    live: HashSet<u64>,
    next_connection: u64,
    next_tag: DeliveryTag,
    refuse_connections: u32,
    published: VecDeque<PublishedMessage>,
    stats: BrokerStats,
}

impl BrokerState {
    /// Unacknowledged deliveries of a closed connection go back to the head of their queue.
    fn disconnect(&mut self, connection: u64) -> bool {
        if !self.live.remove(&connection) {
            return false;
        }
        let tags: Vec<DeliveryTag> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(inflight) = self.inflight.remove(&tag) {
                self.return_to_queue(inflight);
            }
        }
        true
    }

    fn return_to_queue(&mut self, inflight: Inflight) {
        let mut message = inflight.message;
        message.redelivered = true;
        self.queues
            .entry(inflight.queue)
            .or_default()
            .push_front(message);
    }
}

enum Next {
    Delivery(Delivery),
    Empty,
    Closed,
}

/// Broker living in process memory: durable queues, fanout exchanges, manual
/// acknowledgement, prefetch limits and redelivery on disconnect. Connection
/// failures can be injected.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            changes: Arc::new(changes),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Put a message on a queue, declaring the queue if needed.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                payload: payload.into(),
                redelivered: false,
            });
        self.bump();
    }

    /// Bind a new subscriber to a fanout exchange. Only messages published after binding are received.
    pub fn bind(&self, exchange: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.state.lock().refuse_connections = count;
    }

    /// Drop every open connection as if the broker went away.
    pub fn drop_connections(&self) {
        {
            let mut guard = self.state.lock();
            let live: Vec<u64> = guard.live.iter().copied().collect();
            for connection in live {
                guard.disconnect(connection);
            }
        }
        self.bump();
    }

    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(VecDeque::len)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// The last `PUBLISHED_HISTORY` publishes, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.iter().cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    fn is_live(&self, connection: u64) -> bool {
        self.state.lock().live.contains(&connection)
    }

    fn take_next(&self, connection: u64, queue: &str, prefetch: u16) -> Next {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.live.contains(&connection) {
            return Next::Closed;
        }
        if prefetch > 0 {
            let unacked = state
                .inflight
                .values()
                .filter(|inflight| inflight.connection == connection)
                .count();
            if unacked >= usize::from(prefetch) {
                return Next::Empty;
            }
        }
        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Next::Empty;
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };
        state.inflight.insert(
            tag,
            Inflight {
                queue: queue.to_string(),
                message,
                connection,
            },
        );
        Next::Delivery(delivery)
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut guard = self.state.lock();
        if guard.refuse_connections > 0 {
            guard.refuse_connections -= 1;
            guard.stats.refused_connections += 1;
            return Err(BrokerError::Network("connection refused".into()));
        }
        guard.next_connection += 1;
        let connection = guard.next_connection;
        guard.live.insert(connection);
        guard.stats.connections += 1;
        drop(guard);

        Ok(Arc::new(InMemoryChannel {
            broker: self.clone(),
            connection,
            prefetch: Arc::new(AtomicU16::new(0)),
        }))
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
    prefetch: Arc<AtomicU16>,
}

impl InMemoryChannel {
    fn ensure_live(&self) -> Result<(), BrokerError> {
        if self.broker.is_live(self.connection) {
            Ok(())
        } else {
            Err(BrokerError::ChannelUnavailable)
        }
    }

    fn settle(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut guard = self.broker.state.lock();
            if !guard.live.contains(&self.connection) {
                return Err(BrokerError::ChannelUnavailable);
            }
            let owned = guard
                .inflight
                .get(&tag)
                .is_some_and(|inflight| inflight.connection == self.connection);
            if !owned {
                return Err(BrokerError::UnknownDelivery(tag));
            }
            if let Some(inflight) = guard.inflight.remove(&tag) {
                if requeue {
                    guard.return_to_queue(inflight);
                    guard.stats.requeues += 1;
                } else {
                    guard.stats.acks += 1;
                }
            }
        }
        self.broker.bump();
        Ok(())
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_live()?;
        self.broker
            .state
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_fanout(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_live()?;
        self.broker
            .state
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_live()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        {
            let mut guard = self.broker.state.lock();
            if !guard.live.contains(&self.connection) {
                return Err(BrokerError::ChannelUnavailable);
            }
            if !guard.queues.contains_key(queue) {
                return Err(BrokerError::Internal(format!("no queue '{queue}'")));
            }
            guard.stats.subscriptions += 1;
        }

        let broker = self.broker.clone();
        let rx = broker.changes.subscribe();
        let connection = self.connection;
        let prefetch = Arc::clone(&self.prefetch);
        let queue = queue.to_string();

        let stream = futures_util::stream::unfold((broker, rx), move |(broker, mut rx)| {
            let queue = queue.clone();
            let prefetch = Arc::clone(&prefetch);
            async move {
                loop {
                    drop(rx.borrow_and_update());
                    match broker.take_next(connection, &queue, prefetch.load(Ordering::SeqCst)) {
                        Next::Delivery(delivery) => return Some((Ok(delivery), (broker, rx))),
                        Next::Closed => return None,
                        Next::Empty => {
                            if rx.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.settle(tag, false)
    }

    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.settle(tag, true)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        {
            let mut guard = self.broker.state.lock();
            let state = &mut *guard;
            if !state.live.contains(&self.connection) {
                return Err(BrokerError::ChannelUnavailable);
            }

            if exchange.is_empty() {
                let queue = state
                    .queues
                    .get_mut(routing_key)
                    .ok_or_else(|| BrokerError::Internal(format!("no queue '{routing_key}'")))?;
                queue.push_back(StoredMessage {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            } else {
                let subscribers = state
                    .exchanges
                    .get_mut(exchange)
                    .ok_or_else(|| BrokerError::Internal(format!("no exchange '{exchange}'")))?;
                subscribers.retain(|subscriber| subscriber.send(payload.to_vec()).is_ok());
            }

            if state.published.len() == PUBLISHED_HISTORY {
                state.published.pop_front();
            }
            state.published.push_back(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                persistent,
            });
        }
        self.broker.bump();
        Ok(())
    }

    async fn closed(&self) -> BrokerError {
        let mut rx = self.broker.changes.subscribe();
        loop {
            drop(rx.borrow_and_update());
            if !self.broker.is_live(self.connection) {
                return BrokerError::Network("connection dropped".into());
            }
            if rx.changed().await.is_err() {
                return BrokerError::Network("broker shut down".into());
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let closed = self.broker.state.lock().disconnect(self.connection);
        if closed {
            self.broker.bump();
        }
        Ok(())
    }
}
