use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_models::jobs::ResultRecord;
use serde::Deserialize;

use crate::{
    consumer::dispatch,
    in_memory::{InMemoryBroker, PUBLISHED_HISTORY},
    BrokerError, BrokerLink, Channel, ConnectionState, Consumer, Delivery, DeliveryStream,
    DeliveryTag, Disposition, HandlerError, JobHandler, Publisher, ReconnectPolicy, Topology,
    Transport,
};

const QUEUE: &str = "notification.fcm";
const TOPIC: &str = "notification.done";

#[derive(Debug, Deserialize)]
struct Ping {
    #[allow(dead_code)]
    id: String,
}

#[derive(Clone, Copy)]
enum Mode {
    Ack,
    Reject,
    Fail,
    Panic,
}

struct TestHandler {
    mode: Mode,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl TestHandler {
    fn new(mode: Mode) -> Arc<Self> {
        Self::slow(mode, Duration::ZERO)
    }

    fn slow(mode: Mode, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    type Job = Ping;

    async fn handle(&self, _job: Ping) -> Result<Disposition, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match self.mode {
            Mode::Ack => Ok(Disposition::Ack),
            Mode::Reject => Ok(Disposition::Reject),
            Mode::Fail => Err("downstream unavailable".into()),
            Mode::Panic => panic!("handler bug"),
        }
    }
}

fn policy(delay_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
        delay: Duration::from_millis(delay_ms),
        max_attempts: None,
        close_timeout: Duration::from_secs(1),
    }
}

fn link(broker: &InMemoryBroker, delay_ms: u64) -> Arc<BrokerLink> {
    Arc::new(BrokerLink::new(
        Arc::new(broker.clone()),
        Topology::new(QUEUE, TOPIC),
        policy(delay_ms),
    ))
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Take one delivery from the work queue on a fresh channel.
async fn next_delivery(link: &BrokerLink) -> Delivery {
    let channel = link.open_channel().unwrap();
    channel.prefetch(1).await.unwrap();
    let mut stream = channel.consume(QUEUE, "test").await.unwrap();
    within(stream.next()).await.unwrap().unwrap()
}

#[tokio::test]
async fn connect_declares_durable_topology() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);

    let session = link.connect().await.unwrap();

    assert_eq!(session.id, 1);
    assert_eq!(link.state(), ConnectionState::Connected);
    assert_eq!(broker.queue_len(QUEUE), Some(0));
    assert!(broker.has_exchange(TOPIC));
}

#[tokio::test]
async fn failed_handshake_returns_to_disconnected() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(1);
    let link = link(&broker, 10);

    let err = link.connect().await.err().unwrap();

    assert!(matches!(err, BrokerError::Network(_)));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(matches!(link.open_channel(), Err(BrokerError::ChannelUnavailable)));
}

#[tokio::test]
async fn malformed_payload_is_requeued_without_invoking_handler() {
    for payload in [&b"not json"[..], br#"{"other":"field"}"#, br#"{"id":7}"#] {
        let broker = InMemoryBroker::new();
        let link = link(&broker, 10);
        link.connect().await.unwrap();
        let consumer = Consumer::new(Arc::clone(&link), "test");
        let handler = TestHandler::new(Mode::Ack);

        broker.enqueue(QUEUE, payload);
        let delivery = next_delivery(&link).await;
        let channel = link.open_channel().unwrap();
        consumer.process(channel.as_ref(), delivery, &handler).await;

        assert_eq!(handler.calls(), 0);
        let stats = broker.stats();
        assert_eq!(stats.acks, 0);
        assert_eq!(stats.requeues, 1);
        assert_eq!(broker.queue_len(QUEUE), Some(1));
        assert_eq!(broker.inflight_len(), 0);
    }
}

#[tokio::test]
async fn requeued_message_comes_back_marked_redelivered() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    broker.enqueue(QUEUE, "not json");

    let first = next_delivery(&link).await;
    assert!(!first.redelivered);
    link.open_channel().unwrap().requeue(first.tag).await.unwrap();

    let second = next_delivery(&link).await;
    assert!(second.redelivered);
    assert_eq!(second.payload, b"not json");
}

#[tokio::test]
async fn dispositions_map_to_exactly_one_settlement() {
    for (mode, expected) in [
        (Mode::Ack, Disposition::Ack),
        (Mode::Reject, Disposition::Reject),
        (Mode::Fail, Disposition::Reject),
        (Mode::Panic, Disposition::Reject),
    ] {
        let handler = TestHandler::new(mode);
        let delivery = Delivery {
            tag: 1,
            payload: br#"{"id":"a"}"#.to_vec(),
            redelivered: false,
        };
        assert_eq!(dispatch(&delivery, &handler).await, expected);
        assert_eq!(handler.calls(), 1);
    }
}

#[tokio::test]
async fn settles_valid_delivery_once() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    let consumer = Consumer::new(Arc::clone(&link), "test");

    broker.enqueue(QUEUE, r#"{"id":"a"}"#);
    let delivery = next_delivery(&link).await;
    let channel = link.open_channel().unwrap();
    consumer
        .process(channel.as_ref(), delivery, &TestHandler::new(Mode::Ack))
        .await;

    broker.enqueue(QUEUE, r#"{"id":"b"}"#);
    let delivery = next_delivery(&link).await;
    consumer
        .process(channel.as_ref(), delivery, &TestHandler::new(Mode::Fail))
        .await;

    let stats = broker.stats();
    assert_eq!(stats.acks, 1);
    assert_eq!(stats.requeues, 1);
    assert_eq!(broker.queue_len(QUEUE), Some(1));
    assert_eq!(broker.inflight_len(), 0);
}

#[tokio::test]
async fn processes_one_delivery_at_a_time() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    let handler = TestHandler::slow(Mode::Ack, Duration::from_millis(20));
    for id in 0..4 {
        broker.enqueue(QUEUE, format!(r#"{{"id":"{id}"}}"#));
    }

    let supervisor = tokio::spawn({
        let link = Arc::clone(&link);
        async move { link.run().await }
    });
    let consumer = tokio::spawn({
        let consumer = Consumer::new(Arc::clone(&link), "test");
        let handler = Arc::clone(&handler);
        async move { consumer.run(handler).await }
    });

    eventually("four acks", || broker.stats().acks == 4).await;
    assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stats().requeues, 0);

    link.close().await.unwrap();
    within(consumer).await.unwrap();
    within(supervisor).await.unwrap().unwrap();
}

#[tokio::test]
async fn unacked_delivery_blocks_the_next_one() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    broker.enqueue(QUEUE, r#"{"id":"a"}"#);
    broker.enqueue(QUEUE, r#"{"id":"b"}"#);

    let channel = link.open_channel().unwrap();
    channel.prefetch(1).await.unwrap();
    let mut stream = channel.consume(QUEUE, "test").await.unwrap();
    let first = within(stream.next()).await.unwrap().unwrap();

    let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err());

    channel.ack(first.tag).await.unwrap();
    let second = within(stream.next()).await.unwrap().unwrap();
    assert_eq!(second.payload, br#"{"id":"b"}"#);
}

#[tokio::test]
async fn reconnect_converges_after_failed_attempts() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(3);
    let link = link(&broker, 20);
    let handler = TestHandler::new(Mode::Ack);
    broker.enqueue(QUEUE, r#"{"id":"a"}"#);

    let supervisor = tokio::spawn({
        let link = Arc::clone(&link);
        async move { link.run().await }
    });
    let consumer = tokio::spawn({
        let consumer = Consumer::new(Arc::clone(&link), "test");
        let handler = Arc::clone(&handler);
        async move { consumer.run(handler).await }
    });

    eventually("the queued job", || broker.stats().acks == 1).await;
    let stats = broker.stats();
    assert_eq!(stats.refused_connections, 3);
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.subscriptions, 1);

    link.close().await.unwrap();
    within(consumer).await.unwrap();
    within(supervisor).await.unwrap().unwrap();
}

#[tokio::test]
async fn connection_drop_resubscribes_without_losing_messages() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 100);
    let handler = TestHandler::new(Mode::Ack);
    let mut states = link.watch_state();

    let supervisor = tokio::spawn({
        let link = Arc::clone(&link);
        async move { link.run().await }
    });
    let consumer = tokio::spawn({
        let consumer = Consumer::new(Arc::clone(&link), "test");
        let handler = Arc::clone(&handler);
        async move { consumer.run(handler).await }
    });

    broker.enqueue(QUEUE, r#"{"id":"before"}"#);
    eventually("the first job", || broker.stats().acks == 1).await;

    broker.drop_connections();
    within(states.wait_for(|state| *state == ConnectionState::Disconnected))
        .await
        .unwrap();
    assert!(!link.is_connected());

    broker.enqueue(QUEUE, r#"{"id":"during-1"}"#);
    broker.enqueue(QUEUE, r#"{"id":"during-2"}"#);

    eventually("jobs queued while disconnected", || broker.stats().acks == 3).await;
    assert!(link.is_connected());
    let stats = broker.stats();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(handler.calls(), 3);

    link.close().await.unwrap();
    within(consumer).await.unwrap();
    within(supervisor).await.unwrap().unwrap();
}

#[tokio::test]
async fn job_in_progress_during_connection_drop_is_redelivered() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 20);
    let handler = TestHandler::slow(Mode::Ack, Duration::from_millis(200));

    let supervisor = tokio::spawn({
        let link = Arc::clone(&link);
        async move { link.run().await }
    });
    let consumer = tokio::spawn({
        let consumer = Consumer::new(Arc::clone(&link), "test");
        let handler = Arc::clone(&handler);
        async move { consumer.run(handler).await }
    });

    broker.enqueue(QUEUE, r#"{"id":"slow"}"#);
    eventually("the handler to start", || handler.calls() == 1).await;
    broker.drop_connections();

    eventually("the redelivered job", || broker.stats().acks == 1).await;
    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.queue_len(QUEUE), Some(0));
    assert_eq!(broker.inflight_len(), 0);
    assert_eq!(broker.stats().connections, 2);

    link.close().await.unwrap();
    within(consumer).await.unwrap();
    within(supervisor).await.unwrap().unwrap();
}

/// In-memory transport whose first session cannot start a consumer. Counts channel closes.
struct FirstConsumeFails {
    broker: InMemoryBroker,
    sessions: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

struct CountingChannel {
    inner: Arc<dyn Channel>,
    refuse_consume: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FirstConsumeFails {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let inner = self.broker.connect().await?;
        Ok(Arc::new(CountingChannel {
            inner,
            refuse_consume: self.sessions.fetch_add(1, Ordering::SeqCst) == 0,
            closes: Arc::clone(&self.closes),
        }))
    }
}

#[async_trait]
impl Channel for CountingChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.declare_queue(name).await
    }

    async fn declare_fanout(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.declare_fanout(name).await
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner.prefetch(count).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        if self.refuse_consume {
            return Err(BrokerError::Internal("consumer refused".into()));
        }
        self.inner.consume(queue, consumer_tag).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.ack(tag).await
    }

    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.requeue(tag).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        self.inner.publish(exchange, routing_key, payload, persistent).await
    }

    async fn closed(&self) -> BrokerError {
        self.inner.closed().await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

#[tokio::test]
async fn session_given_up_by_consumer_is_closed_before_reconnecting() {
    let broker = InMemoryBroker::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let link = Arc::new(BrokerLink::new(
        Arc::new(FirstConsumeFails {
            broker: broker.clone(),
            sessions: AtomicUsize::new(0),
            closes: Arc::clone(&closes),
        }),
        Topology::new(QUEUE, TOPIC),
        policy(20),
    ));
    let handler = TestHandler::new(Mode::Ack);
    broker.enqueue(QUEUE, r#"{"id":"a"}"#);

    let supervisor = tokio::spawn({
        let link = Arc::clone(&link);
        async move { link.run().await }
    });
    let consumer = tokio::spawn({
        let consumer = Consumer::new(Arc::clone(&link), "test");
        let handler = Arc::clone(&handler);
        async move { consumer.run(handler).await }
    });

    eventually("the job on the second session", || broker.stats().acks == 1).await;
    assert_eq!(broker.stats().connections, 2);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    link.close().await.unwrap();
    within(consumer).await.unwrap();
    within(supervisor).await.unwrap().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn gives_up_when_retry_cap_is_reached() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(5);
    let link = BrokerLink::new(
        Arc::new(broker.clone()),
        Topology::new(QUEUE, TOPIC),
        ReconnectPolicy {
            max_attempts: Some(2),
            ..policy(5)
        },
    );

    let result = within(link.run()).await;

    assert!(matches!(result, Err(BrokerError::Network(_))));
    assert_eq!(broker.stats().refused_connections, 2);
}

#[tokio::test]
async fn publisher_writes_persistent_fanout_message() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    let mut subscriber = broker.bind(TOPIC);
    let record = ResultRecord {
        identifier: "fcm-msg-1".into(),
        deliver_at: "2024-05-01T10:00:00.000Z".into(),
    };

    Publisher::new(Arc::clone(&link)).publish(&record).await.unwrap();

    let received = within(subscriber.recv()).await.unwrap();
    assert_eq!(ResultRecord::from_json(&received).unwrap(), record);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, TOPIC);
    assert_eq!(published[0].routing_key, "");
    assert!(published[0].persistent);
}

#[tokio::test]
async fn publish_history_keeps_only_the_latest_messages() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    let channel = link.open_channel().unwrap();

    for n in 0..PUBLISHED_HISTORY + 5 {
        channel
            .publish(TOPIC, "", n.to_string().as_bytes(), true)
            .await
            .unwrap();
    }

    let published = broker.published();
    assert_eq!(published.len(), PUBLISHED_HISTORY);
    assert_eq!(published[0].payload, b"5");
    assert_eq!(
        published[PUBLISHED_HISTORY - 1].payload,
        (PUBLISHED_HISTORY + 4).to_string().as_bytes()
    );
}

#[tokio::test]
async fn late_subscriber_does_not_see_earlier_results() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    let publisher = Publisher::new(Arc::clone(&link));

    publisher
        .publish(&ResultRecord {
            identifier: "early".into(),
            deliver_at: "2024-05-01T10:00:00.000Z".into(),
        })
        .await
        .unwrap();
    let mut late = broker.bind(TOPIC);

    assert!(late.try_recv().is_err());
}

#[tokio::test]
async fn publish_without_session_fails() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    let record = ResultRecord {
        identifier: "x".into(),
        deliver_at: "2024-05-01T10:00:00.000Z".into(),
    };

    let result = Publisher::new(link).publish(&record).await;

    assert!(matches!(result, Err(BrokerError::ChannelUnavailable)));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn subscribe_without_session_fails() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);

    let result = Consumer::new(link, "test")
        .subscribe(TestHandler::new(Mode::Ack))
        .await;

    assert!(matches!(result, Err(BrokerError::ChannelUnavailable)));
}

#[tokio::test]
async fn close_is_terminal() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();

    link.close().await.unwrap();

    assert_eq!(link.state(), ConnectionState::Closing);
    assert!(matches!(link.connect().await, Err(BrokerError::Closed)));
    within(link.run()).await.unwrap();
    assert_eq!(link.state(), ConnectionState::Closing);
}

#[tokio::test]
async fn close_returns_unacked_deliveries_to_the_queue() {
    let broker = InMemoryBroker::new();
    let link = link(&broker, 10);
    link.connect().await.unwrap();
    broker.enqueue(QUEUE, r#"{"id":"a"}"#);
    let _delivery = next_delivery(&link).await;

    link.close().await.unwrap();

    assert_eq!(broker.inflight_len(), 0);
    assert_eq!(broker.queue_len(QUEUE), Some(1));
}
