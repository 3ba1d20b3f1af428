//! `SessionClient`: the per-session composition root.
//!
//! ## Design
//! Each client owns one actor task holding the connection manager, presence
//! registry, typing tracker and stream coordinator. The actor is the only
//! code that touches them, so none of that state needs a lock. It races four
//! sources in one `select!`:
//!
//! - commands from the [`SessionClient`] handle;
//! - the connection (dial completion, inbound frames, reconnect and heartbeat timers);
//! - the active generation stream;
//! - the earliest typing-indicator deadline.
//!
//! Frames and stream chunks are each handled in arrival order; there is no
//! ordering between the two sources. [`StreamCoordinator`] reconciles them.
//!
//! Tearing down (explicit [`SessionClient::teardown`] or dropping the handle)
//! closes the connection, cancels the reconnect timer, drops the generation
//! stream and clears every typing deadline before the task exits.

use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{
    sleep_until_opt, CloseReason, ConnectionManager, ConnectionState, Connector, LinkEvent,
    ReconnectPolicy, Wake,
};
use crate::coordinator::{StreamCoordinator, TranscriptEvent};
use crate::error::{GenerationError, ProtocolError, SubmitError, TransportError};
use crate::generation::{ChunkStream, GenerationChunk, GenerationRequest, GenerationSource};
use crate::model::{is_known_role, Identity, LocalId, Message, Participant, ParticipantId, Session};
use crate::presence::PresenceRegistry;
use crate::protocol::{self, Intent, ServerFrame};
use crate::typing::{OutboundTyping, TypingTracker};
use futures_util::StreamExt;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoticeLevel::Info => write!(f, "info"),
            NoticeLevel::Warning => write!(f, "warning"),
            NoticeLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingPeer {
    pub participant_id: ParticipantId,
    pub nickname: String,
}

/// Everything the rendering layer is told about a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Full roster snapshot in join order.
    PresenceChanged(Vec<Participant>),
    /// Peers currently typing.
    TypingChanged(Vec<TypingPeer>),
    TranscriptAppend(Message),
    /// Re-render the bubble with the same `local_id`.
    TranscriptUpdate(Message),
    /// Transient notification.
    Notice { level: NoticeLevel, text: String },
    /// Reconnect attempts are exhausted. No further automatic recovery.
    FatalDisconnect { reason: String },
}

enum Command {
    Submit {
        content: String,
        reply: oneshot::Sender<Result<LocalId, SubmitError>>,
    },
    Typing,
    SetRole(String),
    Leave,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to one running session. Dropping it tears the session down.
pub struct SessionClient {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Start the session actor. Collaborative sessions begin connecting
    /// immediately; private sessions never open a connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create<C, G>(
        config: &ClientConfig,
        session: Session,
        identity: Identity,
        connector: C,
        generator: G,
    ) -> (SessionClient, mpsc::UnboundedReceiver<SessionEvent>)
    where
        C: Connector,
        G: GenerationSource,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let link = ConnectionManager::new(connector, config.server.ws_url.clone(), ReconnectPolicy::from_config(config))
            .with_heartbeat(config.heartbeat_interval());
        let actor = SessionActor {
            coordinator: StreamCoordinator::new(&session.id, session.is_collaborative(), identity.clone()),
            session_id: session.id.clone(),
            session,
            identity,
            link,
            presence: PresenceRegistry::new(),
            typing: TypingTracker::new(config.typing_expiry()),
            outbound_typing: OutboundTyping::new(config.typing_throttle()),
            generator,
            generation: None,
            commands: command_rx,
            events: event_tx,
        };
        let session_id = actor.session_id.clone();
        let task = tokio::spawn(actor.run());

        (
            SessionClient {
                session_id,
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Submit a question. Resolves once the user bubble and the agent
    /// placeholder are in the transcript and generation has started.
    pub async fn submit(&self, content: impl Into<String>) -> Result<LocalId, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                content: content.into(),
                reply,
            })
            .map_err(|_| SubmitError::SessionClosed)?;
        rx.await.map_err(|_| SubmitError::SessionClosed)?
    }

    /// The local user is typing. Throttled; a no-op for private sessions.
    pub fn notify_typing(&self) {
        let _ = self.commands.send(Command::Typing);
    }

    /// Switch the assistant role used for subsequent questions.
    pub fn set_role(&self, role_key: impl Into<String>) {
        let _ = self.commands.send(Command::SetRole(role_key.into()));
    }

    /// Leave the session and wait until every timer and stream is gone.
    pub async fn teardown(self) {
        let _ = self.commands.send(Command::Leave);
        if let Err(e) = self.task.await {
            warn!(error = %e, session_id = %self.session_id, "session task ended abnormally");
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct SessionActor<C: Connector, G: GenerationSource> {
    session_id: String,
    session: Session,
    identity: Identity,
    link: ConnectionManager<C>,
    presence: PresenceRegistry,
    typing: TypingTracker,
    outbound_typing: OutboundTyping,
    coordinator: StreamCoordinator,
    generator: G,
    generation: Option<ChunkStream>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

enum Step<T> {
    Command(Option<Command>),
    Link(Wake<T>),
    Chunk(Option<Result<GenerationChunk, GenerationError>>),
    TypingExpired,
}

impl<C: Connector, G: GenerationSource> SessionActor<C, G> {
    async fn run(mut self) {
        info!(session_id = %self.session_id, kind = %self.session.kind, "session started");
        if self.session.is_collaborative() {
            self.link.connect(&self.session.id, self.identity.clone());
            self.forward_link_events();
        }

        let reason = loop {
            let typing_deadline = self.typing.next_deadline();
            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                wake = self.link.wait() => Step::Link(wake),
                chunk = next_chunk(&mut self.generation) => Step::Chunk(chunk),
                _ = sleep_until_opt(typing_deadline) => Step::TypingExpired,
            };

            match step {
                Step::Command(None) => break CloseReason::Teardown,
                Step::Command(Some(Command::Leave)) => break CloseReason::User,
                Step::Command(Some(Command::Submit { content, reply })) => {
                    let result = self.submit(&content).await;
                    let _ = reply.send(result);
                }
                Step::Command(Some(Command::Typing)) => self.send_typing().await,
                Step::Command(Some(Command::SetRole(key))) => self.set_role(key),
                Step::Link(wake) => {
                    self.link.handle(wake).await;
                    self.forward_link_events();
                }
                Step::Chunk(Some(Ok(chunk))) => self.coordinator.apply_chunk(chunk),
                Step::Chunk(Some(Err(e))) => self.coordinator.fail(&e.to_string()),
                Step::Chunk(None) => self.coordinator.end_of_stream(),
                Step::TypingExpired => {
                    if !self.typing.expire(Instant::now()).is_empty() {
                        self.emit_typing();
                    }
                }
            }

            if !self.coordinator.is_generating() && self.generation.take().is_some() {
                debug!("generation stream released");
            }
            self.flush_transcript();
        };

        self.teardown(reason).await;
    }

    async fn submit(&mut self, content: &str) -> Result<LocalId, SubmitError> {
        let exchange = self.coordinator.submit(content)?;
        self.flush_transcript();

        if self.session.is_collaborative() {
            if self.outbound_typing.take_stop() && self.link.is_open() {
                let _ = self.link.send(&Intent::StopTyping).await;
            }
            let sent = if self.link.is_open() {
                let chat = Intent::Chat {
                    content: exchange.content.clone(),
                    client_id: Some(exchange.user_local_id.clone()),
                };
                self.link.send(&chat).await
            } else {
                Err(TransportError::NotConnected)
            };
            if let Err(e) = sent {
                warn!(error = %e, state = %self.link.state(), "message not broadcast");
                self.coordinator
                    .mark_undelivered(&exchange.user_local_id, &format!("not delivered: {e}"));
                self.notice(
                    NoticeLevel::Warning,
                    "Not connected: other participants will not see this message",
                );
            }
            self.forward_link_events();
        }

        let request = GenerationRequest::for_session(&self.session, &exchange.content, self.coordinator.self_id());
        self.generation = Some(self.generator.open(request));
        Ok(exchange.user_local_id)
    }

    async fn send_typing(&mut self) {
        if !self.session.is_collaborative() || !self.link.is_open() {
            return;
        }
        if self.outbound_typing.should_send(Instant::now()) {
            let _ = self.link.send(&Intent::Typing).await;
            self.forward_link_events();
        }
    }

    fn set_role(&mut self, key: String) {
        if !is_known_role(&key) {
            warn!(role = %key, "unknown role key");
            self.notice(NoticeLevel::Warning, format!("Unknown role '{key}'"));
            return;
        }
        if self.session.role_key == key {
            return;
        }
        info!(session_id = %self.session_id, role = %key, "role switched");
        self.coordinator
            .append_system(format!("Switched to the {key} perspective"));
        self.session.role_key = key;
    }

    // -----------------------------------------------------------------------
    // Connection events
    // -----------------------------------------------------------------------

    fn forward_link_events(&mut self) {
        for event in self.link.take_events() {
            match event {
                LinkEvent::StateChanged(state) => {
                    if state == ConnectionState::Open {
                        self.coordinator.reset_live_order();
                    }
                    self.emit(SessionEvent::StateChanged(state));
                }
                LinkEvent::Frame(text) => self.on_frame(&text),
                LinkEvent::RetryScheduled {
                    attempt,
                    max_attempts,
                    delay,
                    ..
                } => {
                    self.drop_live_state();
                    self.notice(
                        NoticeLevel::Warning,
                        format!(
                            "Connection lost, retrying in {}s ({attempt}/{max_attempts})",
                            delay.as_secs()
                        ),
                    );
                }
                LinkEvent::Exhausted { attempts, cause } => {
                    self.drop_live_state();
                    self.coordinator
                        .append_system("Connection lost. Rejoin the session to continue.");
                    self.emit(SessionEvent::FatalDisconnect {
                        reason: format!("gave up after {attempts} reconnect attempts: {cause}"),
                    });
                }
            }
        }
    }

    /// Presence and typing describe a live connection only.
    fn drop_live_state(&mut self) {
        self.coordinator.set_self_id(None);
        if self.presence.clear() {
            self.emit(SessionEvent::PresenceChanged(Vec::new()));
        }
        if self.typing.clear_all() {
            self.emit_typing();
        }
    }

    fn on_frame(&mut self, text: &str) {
        let frame = match protocol::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                self.protocol_error(e);
                return;
            }
        };

        match frame {
            ServerFrame::JoinSuccess { participant_id, nickname } => {
                info!(participant_id = %participant_id, nickname = %nickname, "joined session");
                self.coordinator.set_self_id(Some(participant_id));
                self.notice(NoticeLevel::Info, format!("Joined as {nickname}"));
            }
            ServerFrame::UserJoined(wire) => {
                let participant = wire.into_participant();
                let nickname = participant.nickname.clone();
                let is_self = self.coordinator.self_id() == Some(&participant.participant_id);
                if self.presence.upsert(participant) {
                    self.emit_presence();
                    if !is_self {
                        self.coordinator
                            .append_system(format!("{nickname} joined the session"));
                    }
                }
            }
            ServerFrame::UserLeft { participant_id, nickname } => {
                if self.typing.clear(&participant_id) {
                    self.emit_typing();
                }
                if let Some(gone) = self.presence.remove(&participant_id) {
                    self.emit_presence();
                    let name = if nickname.is_empty() { gone.nickname } else { nickname };
                    self.coordinator.append_system(format!("{name} left the session"));
                }
            }
            ServerFrame::OnlineUsers { users } => {
                let added = self
                    .presence
                    .merge_roster(users.into_iter().map(|u| u.into_participant()));
                if added > 0 {
                    self.emit_presence();
                }
            }
            ServerFrame::History { messages } => {
                debug!(count = messages.len(), "history received");
                self.coordinator.on_history(messages);
            }
            ServerFrame::Chat { message } => self.coordinator.on_chat(message),
            ServerFrame::Typing { participant_id, nickname } => {
                if self.coordinator.self_id() == Some(&participant_id) {
                    return;
                }
                if self.typing.signal(participant_id, &nickname, Instant::now()) {
                    self.emit_typing();
                }
            }
            ServerFrame::StopTyping { participant_id } => {
                if self.typing.clear(&participant_id) {
                    self.emit_typing();
                }
            }
            ServerFrame::Error { message } => self.protocol_error(ProtocolError::Server(message)),
            ServerFrame::Pong => debug!("pong"),
        }
    }

    /// Protocol problems never drop the connection; they surface as notices.
    fn protocol_error(&self, error: ProtocolError) {
        match error {
            ProtocolError::Server(message) => {
                warn!(message = %message, "server reported an error");
                self.notice(NoticeLevel::Error, message);
            }
            other => {
                warn!(error = %other, "dropping malformed frame");
                self.notice(NoticeLevel::Warning, format!("Ignored a malformed server message ({other})"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(SessionEvent::Notice {
            level,
            text: text.into(),
        });
    }

    fn emit_presence(&self) {
        self.emit(SessionEvent::PresenceChanged(self.presence.snapshot()));
    }

    fn emit_typing(&self) {
        let peers = self
            .typing
            .visible()
            .into_iter()
            .map(|i| TypingPeer {
                participant_id: i.participant_id,
                nickname: i.nickname,
            })
            .collect();
        self.emit(SessionEvent::TypingChanged(peers));
    }

    fn flush_transcript(&mut self) {
        for event in self.coordinator.drain_events() {
            self.emit(match event {
                TranscriptEvent::Appended(m) => SessionEvent::TranscriptAppend(m),
                TranscriptEvent::Updated(m) => SessionEvent::TranscriptUpdate(m),
            });
        }
    }

    async fn teardown(mut self, reason: CloseReason) {
        self.link.close(reason).await;
        self.forward_link_events();
        self.generation = None;
        self.coordinator.abort();
        if self.typing.clear_all() {
            self.emit_typing();
        }
        if self.presence.clear() {
            self.emit(SessionEvent::PresenceChanged(Vec::new()));
        }
        self.flush_transcript();
        info!(session_id = %self.session_id, ?reason, "session torn down");
    }
}

async fn next_chunk(stream: &mut Option<ChunkStream>) -> Option<Result<GenerationChunk, GenerationError>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
