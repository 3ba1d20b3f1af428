//! Connection lifecycle for one collaborative session.
//!
//! ## State machine
//! ```text
//! Disconnected --connect()--> Connecting --dial ok--> Open
//! Connecting / Open --transport lost--> Reconnecting   (attempts left)
//!                                   \--> Failed        (attempts exhausted)
//! Reconnecting --timer--> Connecting
//! any --close()--> Disconnected                        (no retry afterwards)
//! ```
//!
//! Attempt *n* waits `base_delay * 2^(n-1)`. The counter resets on every
//! transition into `Open`. `Failed` is terminal for automatic recovery.
//!
//! ## Driving
//! The owner races [`ConnectionManager::wait`] (cancel-safe) against its other
//! event sources, then feeds the result to [`ConnectionManager::handle`] outside
//! the race. Everything observable (state transitions, inbound frames,
//! scheduled retries, exhaustion) is queued as [`LinkEvent`]s and collected
//! with [`ConnectionManager::take_events`].
//!
//! The manager is the only writer to the transport.

use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::model::Identity;
use crate::protocol::{self, Intent};

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One open, bidirectional text-frame connection.
pub trait FrameConnection: Send + 'static {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound text frame. `None` means the peer closed the connection.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no frame.
    fn next_text(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens [`FrameConnection`]s.
pub trait Connector: Send + 'static {
    type Connection: FrameConnection;

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Self::Connection, TransportError>>;
}

// ---------------------------------------------------------------------------
// State and policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
            max_attempts: config.reconnect.max_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-based), or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.base_delay.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The user left the session.
    User,
    /// The owning client is being torn down (session switch, shutdown).
    Teardown,
}

/// Everything the owner of a [`ConnectionManager`] needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    Frame(String),
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        cause: String,
    },
    Exhausted {
        attempts: u32,
        cause: String,
    },
}

/// Result of [`ConnectionManager::wait`]; pass it to [`ConnectionManager::handle`].
pub enum Wake<T> {
    Dialed(Result<T, TransportError>),
    Inbound(Option<Result<String, TransportError>>),
    RetryDue,
    HeartbeatDue,
}

#[derive(Debug)]
struct Heartbeat {
    interval: Duration,
    next_at: Option<Instant>,
    awaiting_reply: bool,
}

#[derive(Debug, Clone)]
struct JoinTarget {
    session_id: String,
    identity: Identity,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectionManager<C: Connector> {
    connector: C,
    url: String,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    target: Option<JoinTarget>,
    conn: Option<C::Connection>,
    dialing: Option<BoxFuture<'static, Result<C::Connection, TransportError>>>,
    retry_at: Option<Instant>,
    heartbeat: Option<Heartbeat>,
    events: VecDeque<LinkEvent>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            url: url.into(),
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            target: None,
            conn: None,
            dialing: None,
            retry_at: None,
            heartbeat: None,
            events: VecDeque::new(),
        }
    }

    /// Send `ping` every `interval` while open; an unanswered ping at the next
    /// tick counts as a lost connection.
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval.map(|interval| Heartbeat {
            interval,
            next_at: None,
            awaiting_reply: false,
        });
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Failures since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the pending reconnect fires, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// Start connecting to `session_id` as `identity`.
    ///
    /// Ignored unless the manager is `Disconnected` or `Failed`.
    pub fn connect(&mut self, session_id: &str, identity: Identity) {
        if !matches!(self.state, ConnectionState::Disconnected | ConnectionState::Failed) {
            warn!(state = %self.state, "connect() ignored: connection already active");
            return;
        }
        self.target = Some(JoinTarget {
            session_id: session_id.to_string(),
            identity,
        });
        self.attempts = 0;
        self.dial();
    }

    fn dial(&mut self) {
        info!(url = %self.url, attempt = self.attempts, "connecting");
        self.dialing = Some(self.connector.connect(&self.url));
        self.set_state(ConnectionState::Connecting);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "connection state change");
            self.state = state;
            self.events.push_back(LinkEvent::StateChanged(state));
        }
    }

    /// Wait for the next thing that needs handling. Cancel-safe.
    ///
    /// Pends forever when there is nothing to wait on.
    pub async fn wait(&mut self) -> Wake<C::Connection> {
        let heartbeat_at = self
            .heartbeat
            .as_ref()
            .and_then(|hb| hb.next_at)
            .filter(|_| self.conn.is_some());
        let retry_at = self.retry_at;

        let Self { dialing, conn, .. } = self;
        let wake = tokio::select! {
            res = poll_dial(dialing) => Wake::Dialed(res),
            frame = poll_frame(conn) => Wake::Inbound(frame),
            _ = sleep_until_opt(retry_at) => Wake::RetryDue,
            _ = sleep_until_opt(heartbeat_at) => Wake::HeartbeatDue,
        };
        if matches!(wake, Wake::Dialed(_)) {
            self.dialing = None;
        }
        wake
    }

    /// Apply the outcome of [`wait`](Self::wait).
    pub async fn handle(&mut self, wake: Wake<C::Connection>) {
        match wake {
            Wake::Dialed(Ok(conn)) => self.on_open(conn).await,
            Wake::Dialed(Err(e)) => {
                warn!(error = %e, "connect failed");
                self.on_lost(e);
            }
            Wake::Inbound(Some(Ok(text))) => {
                if let Some(hb) = self.heartbeat.as_mut() {
                    hb.awaiting_reply = false;
                }
                self.events.push_back(LinkEvent::Frame(text));
            }
            Wake::Inbound(Some(Err(e))) => {
                warn!(error = %e, "transport error");
                self.on_lost(e);
            }
            Wake::Inbound(None) => {
                warn!("connection closed by server");
                self.on_lost(TransportError::Closed);
            }
            Wake::RetryDue => {
                self.retry_at = None;
                if self.state == ConnectionState::Reconnecting {
                    self.dial();
                }
            }
            Wake::HeartbeatDue => self.on_heartbeat().await,
        }
    }

    async fn on_open(&mut self, conn: C::Connection) {
        if self.state != ConnectionState::Connecting {
            // Closed while the dial was in flight.
            return;
        }
        self.conn = Some(conn);
        self.attempts = 0;
        if let Some(hb) = self.heartbeat.as_mut() {
            hb.next_at = Some(Instant::now() + hb.interval);
            hb.awaiting_reply = false;
        }
        self.set_state(ConnectionState::Open);
        info!(url = %self.url, "connection open");

        if let Some(target) = self.target.clone() {
            let join = Intent::Join {
                session_id: target.session_id,
                nickname: target.identity.nickname,
                avatar_color: target.identity.avatar_color,
            };
            // A failed join send has already been routed to on_lost.
            let _ = self.send(&join).await;
        }
    }

    async fn on_heartbeat(&mut self) {
        let Some(hb) = self.heartbeat.as_mut() else {
            return;
        };
        if hb.awaiting_reply {
            let waited = hb.interval.as_millis() as u64;
            hb.next_at = None;
            warn!(waited_ms = waited, "heartbeat unanswered");
            self.on_lost(TransportError::HeartbeatTimeout(waited));
            return;
        }
        hb.awaiting_reply = true;
        hb.next_at = Some(Instant::now() + hb.interval);
        let _ = self.send(&Intent::Heartbeat).await;
    }

    fn on_lost(&mut self, cause: TransportError) {
        self.conn = None;
        self.dialing = None;
        if let Some(hb) = self.heartbeat.as_mut() {
            hb.next_at = None;
            hb.awaiting_reply = false;
        }
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Failed) {
            return;
        }

        let attempt = self.attempts + 1;
        match self.policy.delay_for(attempt) {
            Some(delay) => {
                self.attempts = attempt;
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    cause = %cause,
                    "connection lost, scheduling reconnect"
                );
                self.set_state(ConnectionState::Reconnecting);
                self.events.push_back(LinkEvent::RetryScheduled {
                    attempt,
                    max_attempts: self.policy.max_attempts,
                    delay,
                    cause: cause.to_string(),
                });
            }
            None => {
                self.retry_at = None;
                error!(
                    attempts = self.attempts,
                    cause = %cause,
                    "reconnect attempts exhausted"
                );
                self.set_state(ConnectionState::Failed);
                self.events.push_back(LinkEvent::Exhausted {
                    attempts: self.attempts,
                    cause: cause.to_string(),
                });
            }
        }
    }

    /// Write one intent to the transport. Only valid while `Open`.
    ///
    /// A write failure is treated as a lost connection.
    pub async fn send(&mut self, intent: &Intent) -> Result<(), TransportError> {
        let Some(conn) = self.conn.as_mut().filter(|_| self.state == ConnectionState::Open) else {
            debug!(kind = intent.kind(), state = %self.state, "send skipped: not open");
            return Err(TransportError::NotConnected);
        };
        let text = protocol::encode(intent).map_err(|e| TransportError::Send(e.to_string()))?;
        debug!(kind = intent.kind(), "sending frame");
        match conn.send_text(text).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let detail = e.to_string();
                warn!(error = %detail, kind = intent.kind(), "send failed");
                self.on_lost(e);
                Err(TransportError::Send(detail))
            }
        }
    }

    /// Close intentionally. Cancels any pending reconnect; never retries afterwards.
    pub async fn close(&mut self, reason: CloseReason) {
        info!(?reason, state = %self.state, "closing connection");
        self.retry_at = None;
        self.dialing = None;
        if let Some(hb) = self.heartbeat.as_mut() {
            hb.next_at = None;
            hb.awaiting_reply = false;
        }
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn poll_dial<T>(dialing: &mut Option<BoxFuture<'static, Result<T, TransportError>>>) -> Result<T, TransportError> {
    match dialing.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn poll_frame<T: FrameConnection>(conn: &mut Option<T>) -> Option<Result<String, TransportError>> {
    match conn.as_mut() {
        Some(conn) => conn.next_text().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use rstest::rstest;

    fn identity() -> Identity {
        Identity::new("ana", "#667eea")
    }

    fn manager(connector: MemoryConnector) -> ConnectionManager<MemoryConnector> {
        ConnectionManager::new(connector, "memory://session", ReconnectPolicy::default())
    }

    async fn step(m: &mut ConnectionManager<MemoryConnector>) {
        let wake = m.wait().await;
        m.handle(wake).await;
    }

    #[rstest]
    #[case(1, Some(2_000))]
    #[case(2, Some(4_000))]
    #[case(3, Some(8_000))]
    #[case(4, Some(16_000))]
    #[case(5, Some(32_000))]
    #[case(6, None)]
    #[case(0, None)]
    fn backoff_table(#[case] attempt: u32, #[case] expected_ms: Option<u64>) {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(attempt), expected_ms.map(Duration::from_millis));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            max_attempts: 40,
        };
        assert_eq!(policy.delay_for(40), Some(Duration::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn open_sends_join_and_resets_attempts() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut m = manager(connector);
        m.connect("42", identity());
        step(&mut m).await;

        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(
            m.take_events(),
            vec![
                LinkEvent::StateChanged(ConnectionState::Connecting),
                LinkEvent::StateChanged(ConnectionState::Open),
            ]
        );
        let mut peer = listener.accept().await.unwrap();
        let join: serde_json::Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(join["action"], "join");
        assert_eq!(join["session_id"], 42);
        assert_eq!(join["nickname"], "ana");
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_back_off_then_sixth_fails() {
        let (connector, _listener) = MemoryConnector::new();
        connector.refuse_next(6);
        let mut m = manager(connector);
        m.connect("1", identity());

        let mut delays = Vec::new();
        for _ in 0..5 {
            step(&mut m).await; // dial fails
            assert_eq!(m.state(), ConnectionState::Reconnecting);
            let events = m.take_events();
            let delay = events
                .iter()
                .find_map(|e| match e {
                    LinkEvent::RetryScheduled { delay, .. } => Some(*delay),
                    _ => None,
                })
                .unwrap();
            delays.push(delay.as_millis() as u64);
            step(&mut m).await; // retry timer fires
            assert_eq!(m.state(), ConnectionState::Connecting);
        }
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 32_000]);

        step(&mut m).await;
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(m.retry_at().is_none());
        assert!(m
            .take_events()
            .iter()
            .any(|e| matches!(e, LinkEvent::Exhausted { attempts: 5, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_backoff() {
        let (connector, mut listener) = MemoryConnector::new();
        connector.refuse_next(2);
        let mut m = manager(connector);
        m.connect("1", identity());
        for _ in 0..4 {
            step(&mut m).await; // fail, retry, fail, retry
        }
        assert_eq!(m.attempts(), 2);
        step(&mut m).await; // third dial succeeds
        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.attempts(), 0);
        m.take_events();

        let peer = listener.accept().await.unwrap();
        drop(peer);
        step(&mut m).await;
        let events = m.take_events();
        assert!(events.contains(&LinkEvent::RetryScheduled {
            attempt: 1,
            max_attempts: 5,
            delay: Duration::from_millis(2_000),
            cause: TransportError::Closed.to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_retry() {
        let (connector, _listener) = MemoryConnector::new();
        connector.refuse_next(1);
        let mut m = manager(connector.clone());
        m.connect("1", identity());
        step(&mut m).await;
        assert!(m.retry_at().is_some());

        m.close(CloseReason::User).await;
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.retry_at().is_none());

        let dials = connector.dial_count();
        let waited = tokio::time::timeout(Duration::from_secs(60), m.wait()).await;
        assert!(waited.is_err(), "nothing should wake a closed manager");
        assert_eq!(connector.dial_count(), dials);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_open() {
        let (connector, _listener) = MemoryConnector::new();
        let mut m = manager(connector);
        let err = m.send(&Intent::Typing).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_are_queued_in_order() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut m = manager(connector);
        m.connect("1", identity());
        step(&mut m).await;
        m.take_events();

        let peer = listener.accept().await.unwrap();
        peer.send(r#"{"type":"pong"}"#);
        peer.send(r#"{"type":"error","message":"x"}"#);
        step(&mut m).await;
        step(&mut m).await;
        assert_eq!(
            m.take_events(),
            vec![
                LinkEvent::Frame(r#"{"type":"pong"}"#.into()),
                LinkEvent::Frame(r#"{"type":"error","message":"x"}"#.into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_heartbeat_drops_connection() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut m = manager(connector).with_heartbeat(Some(Duration::from_secs(10)));
        m.connect("1", identity());
        step(&mut m).await;
        let mut peer = listener.accept().await.unwrap();
        let _join = peer.recv().await.unwrap();

        step(&mut m).await; // first tick sends ping
        let ping: serde_json::Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(m.is_open());

        step(&mut m).await; // second tick, still no reply
        assert_eq!(m.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeat_keeps_connection() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut m = manager(connector).with_heartbeat(Some(Duration::from_secs(10)));
        m.connect("1", identity());
        step(&mut m).await;
        let mut peer = listener.accept().await.unwrap();
        let _join = peer.recv().await.unwrap();

        step(&mut m).await; // ping
        let _ping = peer.recv().await.unwrap();
        peer.send(r#"{"type":"pong"}"#);
        step(&mut m).await; // pong arrives
        step(&mut m).await; // next tick sends another ping
        assert!(m.is_open());
    }
}
