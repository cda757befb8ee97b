use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{BrokerError, Channel, ConnectionState, ReconnectPolicy, Topology, Transport};

/// A successful connection together with its channel. Session ids grow by one
/// for every connection the link establishes.
#[derive(Clone)]
pub struct Session {
    pub id: u64,
    pub channel: Arc<dyn Channel>,
    closed: Arc<AtomicBool>,
}

/// Why a consumer stopped using a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Lost,
}

/// Owns the broker connection, the declared topology and the reconnect loop.
/// Shared with the consumer and publisher through an `Arc`.
pub struct BrokerLink {
    transport: Arc<dyn Transport>,
    topology: Topology,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    sessions_opened: AtomicU64,
}

impl BrokerLink {
    pub fn new(transport: Arc<dyn Transport>, topology: Topology, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            topology,
            policy,
            state,
            session: Mutex::new(None),
            sessions_opened: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_closing(&self) -> bool {
        self.state() == ConnectionState::Closing
    }

    /// Observe state transitions, e.g. to react to a lost connection.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The current session, if one is established and not yet lost or closed.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    /// Channel of the current session.
    pub fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.session()
            .map(|session| session.channel)
            .ok_or(BrokerError::ChannelUnavailable)
    }

    fn current_session_id(&self) -> Option<u64> {
        self.session.lock().as_ref().map(|session| session.id)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!("Broker link {} -> {}", current, next);
                *current = next;
                applied = true;
            }
            applied
        });
        applied
    }

    /// One connection handshake followed by the topology declarations.
    pub async fn connect(&self) -> Result<Session, BrokerError> {
        if !self.transition(ConnectionState::Connecting) {
            return Err(BrokerError::Closed);
        }
        info!("Connecting to broker");

        let channel = match self.open_session().await {
            Ok(channel) => channel,
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let id = self.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session {
            id,
            channel,
            closed: Arc::new(AtomicBool::new(false)),
        };
        *self.session.lock() = Some(session.clone());

        if !self.transition(ConnectionState::Connected) {
            self.session.lock().take();
            if let Err(err) = self.close_session(session).await {
                debug!("Closing session {} opened during shutdown: {}", id, err);
            }
            return Err(BrokerError::Closed);
        }

        info!(
            "Broker connected (session {}), queue '{}' and topic '{}' declared",
            id, self.topology.work_queue, self.topology.result_topic
        );
        Ok(session)
    }

    async fn open_session(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self.transport.connect().await?;
        let declared = async {
            channel.declare_queue(&self.topology.work_queue).await?;
            channel.declare_fanout(&self.topology.result_topic).await
        }
        .await;

        if let Err(err) = declared {
            if let Err(close_err) = channel.close().await {
                debug!("Closing channel after failed declaration: {}", close_err);
            }
            return Err(err);
        }
        Ok(channel)
    }

    /// Mark the given session as lost. Ignored when a newer session is already in place.
    pub fn report_lost(&self, session_id: u64, reason: &BrokerError) {
        {
            let mut guard = self.session.lock();
            if guard.as_ref().map(|session| session.id) != Some(session_id) {
                return;
            }
            guard.take();
        }
        if self.transition(ConnectionState::Disconnected) {
            warn!("Broker connection lost (session {}): {}", session_id, reason);
        }
    }

    /// Keeps the link connected until shutdown: connect, hold the session until
    /// it is lost, wait the fixed delay, repeat. Only returns an error when a
    /// retry cap is configured and exhausted.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut failures: u32 = 0;
        loop {
            match self.connect().await {
                Ok(session) => {
                    failures = 0;
                    self.hold(session).await;
                }
                Err(BrokerError::Closed) => break,
                Err(err) => {
                    failures += 1;
                    error!("Failed to connect to broker (attempt {}): {}", failures, err);
                    if let Some(max) = self.policy.max_attempts {
                        if failures >= max {
                            error!("Giving up after {} failed connection attempts", failures);
                            return Err(err);
                        }
                    }
                }
            }

            if self.is_closing() {
                break;
            }
            info!("Reconnecting to broker in {:?}", self.policy.delay);
            if !self.pause(self.policy.delay).await {
                break;
            }
        }
        info!("Broker link stopped");
        Ok(())
    }

    async fn hold(&self, session: Session) {
        let mut rx = self.state.subscribe();
        tokio::select! {
            reason = session.channel.closed() => self.report_lost(session.id, &reason),
            _ = until(&mut rx, |state| !state.is_connected()) => {}
        }

        // A session still in the slot belongs to `close()`. A session given up
        // by its consumer still holds a connection and unacked deliveries.
        if self.current_session_id() != Some(session.id) {
            let id = session.id;
            if let Err(err) = self.close_session(session).await {
                debug!("Closing abandoned session {}: {}", id, err);
            }
        }
    }

    /// Sleeps for `delay`; returns `false` when shutdown is requested first.
    async fn pause(&self, delay: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = until(&mut rx, |state| *state == ConnectionState::Closing) => false,
        }
    }

    /// Waits for a connected session newer than `after`. Returns `None` once the link is closing.
    pub async fn wait_for_session(&self, after: Option<u64>) -> Option<Session> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Closing => return None,
                ConnectionState::Connected => {
                    if let Some(session) = self.session() {
                        if after.map_or(true, |last| session.id > last) {
                            return Some(session);
                        }
                    }
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Resolves once shutdown is requested or `session_id` stops being the live session.
    pub async fn session_ended(&self, session_id: u64) -> SessionEnd {
        let mut rx = self.state.subscribe();
        let mut end = SessionEnd::Lost;
        until(&mut rx, |state| match state {
            ConnectionState::Closing => {
                end = SessionEnd::Shutdown;
                true
            }
            ConnectionState::Connected => self.current_session_id() != Some(session_id),
            _ => true,
        })
        .await;
        end
    }

    /// Enter `Closing`: the supervisor stops reconnecting and consumers stop
    /// taking deliveries. The session stays open for in-flight work.
    pub fn request_close(&self) {
        if self.transition(ConnectionState::Closing) {
            info!("Broker link closing");
        }
    }

    /// Request close, then close channel and connection within the configured timeout.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.request_close();
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        match self.close_session(session).await {
            Ok(()) => {
                info!("Broker connection closed");
                Ok(())
            }
            Err(err) => {
                error!("Error closing broker connection: {}", err);
                Err(err)
            }
        }
    }

    /// Close channel and connection once, giving up after `close_timeout`.
    async fn close_session(&self, session: Session) -> Result<(), BrokerError> {
        if session.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match tokio::time::timeout(self.policy.close_timeout, session.channel.close()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Timed out closing broker session {} after {:?}",
                    session.id, self.policy.close_timeout
                );
                Ok(())
            }
        }
    }
}

async fn until(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> bool {
    rx.wait_for(predicate).await.is_ok()
}
