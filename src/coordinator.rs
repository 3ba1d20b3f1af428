//! Stream coordination: one user question plus one agent answer render as
//! exactly one user bubble and one agent bubble, however many delivery paths
//! report them.
//!
//! ## Delivery paths
//! - the optimistic local echo created by [`StreamCoordinator::submit`];
//! - the broadcast `chat` frame confirming the user message;
//! - the token stream from the generation endpoint;
//! - the broadcast `chat` frame carrying the persisted agent answer.
//!
//! ## Merge rules
//! 1. A user broadcast confirms a local `Pending` message when its `client_id`
//!    names that message, or, failing that, when it was sent by this client's
//!    participant and its content equals the oldest `Pending` user message.
//!    Anything else is another participant's message and is appended.
//! 2. Every user broadcast pushes one slot onto an expected-answer FIFO: the
//!    local agent bubble for own messages, `None` for everyone else's. The
//!    server answers questions in order, so each agent broadcast pops one slot.
//! 3. An agent broadcast whose slot names a local bubble replaces that bubble's
//!    text and marks it `Final`. If that bubble is still streaming, the streamed
//!    draft is discarded and later tokens are ignored; the in-flight guard is
//!    held until the HTTP stream itself ends. A `None` slot renders a new bubble.
//! 4. Server ids already seen are dropped, so redelivered history after a
//!    reconnect never renders twice.
//!
//! The coordinator performs no I/O; it queues [`TranscriptEvent`]s that the
//! session loop forwards to the renderer.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::SubmitError;
use crate::generation::GenerationChunk;
use crate::model::{Citation, DeliveryState, Identity, LocalId, Message, ParticipantId, Role};
use crate::protocol::WireMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// A new bubble.
    Appended(Message),
    /// An existing bubble (same `local_id`) changed; re-render in place.
    Updated(Message),
}

/// Local ids created by one accepted submit.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user_local_id: LocalId,
    pub agent_local_id: LocalId,
    pub content: String,
}

/// The answer currently being generated.
#[derive(Debug, Clone)]
pub struct GenerationStream {
    pub message_local_id: LocalId,
    pub user_local_id: LocalId,
    pub accumulated_text: String,
    pub citations: Vec<Citation>,
    /// A broadcast already delivered the authoritative answer.
    pub superseded: bool,
    received_any: bool,
}

#[derive(Debug, Clone)]
struct ExchangeRecord {
    user: LocalId,
    agent: LocalId,
    answered: bool,
}

pub struct StreamCoordinator {
    session_id: String,
    collaborative: bool,
    identity: Identity,
    self_id: Option<ParticipantId>,
    transcript: Vec<Message>,
    active: Option<GenerationStream>,
    exchanges: Vec<ExchangeRecord>,
    expected_answers: VecDeque<Option<LocalId>>,
    seen_server_ids: HashSet<String>,
    events: Vec<TranscriptEvent>,
}

impl StreamCoordinator {
    pub fn new(session_id: &str, collaborative: bool, identity: Identity) -> Self {
        Self {
            session_id: session_id.to_string(),
            collaborative,
            identity,
            self_id: None,
            transcript: Vec::new(),
            active: None,
            exchanges: Vec::new(),
            expected_answers: VecDeque::new(),
            seen_server_ids: HashSet::new(),
            events: Vec::new(),
        }
    }

    pub fn set_self_id(&mut self, id: Option<ParticipantId>) {
        self.self_id = id;
    }

    pub fn self_id(&self) -> Option<&ParticipantId> {
        self.self_id.as_ref()
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn message(&self, local_id: &LocalId) -> Option<&Message> {
        self.transcript.iter().find(|m| &m.local_id == local_id)
    }

    /// Whether the in-flight guard is held.
    pub fn is_generating(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&GenerationStream> {
        self.active.as_ref()
    }

    pub fn drain_events(&mut self) -> Vec<TranscriptEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Submit and stream
    // -----------------------------------------------------------------------

    /// Append the optimistic user bubble and the agent placeholder, and take
    /// the in-flight guard. Nothing is appended when the submit is rejected.
    pub fn submit(&mut self, content: &str) -> Result<Exchange, SubmitError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SubmitError::EmptyContent);
        }
        if self.active.is_some() {
            return Err(SubmitError::GenerationInFlight);
        }

        let mut user = Message::new(&self.session_id, Role::User, content, DeliveryState::Pending);
        user.sender_participant_id = self.self_id.clone();
        user.sender_nickname = Some(self.identity.nickname.clone());
        user.avatar_color = Some(self.identity.avatar_color.clone());
        let agent = Message::new(&self.session_id, Role::Agent, "", DeliveryState::Streaming);

        let exchange = Exchange {
            user_local_id: user.local_id.clone(),
            agent_local_id: agent.local_id.clone(),
            content: content.to_string(),
        };
        self.append(user);
        self.append(agent);

        if self.collaborative {
            self.exchanges.push(ExchangeRecord {
                user: exchange.user_local_id.clone(),
                agent: exchange.agent_local_id.clone(),
                answered: false,
            });
        }
        self.active = Some(GenerationStream {
            message_local_id: exchange.agent_local_id.clone(),
            user_local_id: exchange.user_local_id.clone(),
            accumulated_text: String::new(),
            citations: Vec::new(),
            superseded: false,
            received_any: false,
        });
        Ok(exchange)
    }

    pub fn apply_chunk(&mut self, chunk: GenerationChunk) {
        let collaborative = self.collaborative;
        let Some(active) = self.active.as_mut() else {
            debug!("chunk with no active generation dropped");
            return;
        };
        let first = !active.received_any;
        active.received_any = true;
        let user_id = active.user_local_id.clone();

        match chunk {
            GenerationChunk::Token(text) => {
                if !active.superseded {
                    active.accumulated_text.push_str(&text);
                    let agent_id = active.message_local_id.clone();
                    let full = active.accumulated_text.clone();
                    self.update(&agent_id, |m| m.content = full);
                }
            }
            GenerationChunk::Citations(batch) => {
                for citation in batch {
                    match active.citations.iter_mut().find(|c| c.source == citation.source) {
                        Some(existing) => *existing = citation,
                        None => active.citations.push(citation),
                    }
                }
                let agent_id = active.message_local_id.clone();
                let citations = active.citations.clone();
                self.update(&agent_id, |m| m.citations = citations);
            }
            GenerationChunk::Done => {
                self.finish();
                return;
            }
        }

        // Private sessions have no broadcast echo; the first chunk is the
        // server's acknowledgement.
        if first && !collaborative {
            self.confirm_local(&user_id, None);
        }
    }

    /// The terminal sentinel arrived. Releases the guard.
    pub fn finish(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if !active.superseded {
            self.update(&active.message_local_id, |m| {
                m.delivery_state = DeliveryState::Final;
            });
        }
        if !self.collaborative {
            self.confirm_local(&active.user_local_id, None);
        }
    }

    /// The stream ended without a terminal sentinel. Releases the guard.
    pub fn end_of_stream(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if active.superseded || !active.accumulated_text.is_empty() {
            warn!(
                local_id = %active.message_local_id,
                "generation stream ended without done marker; keeping received text"
            );
            self.finish();
        } else {
            self.fail("the answer stream ended before any text arrived");
        }
    }

    /// The stream failed. Marks the bubble `Failed`, keeps any partial text,
    /// attaches `error` as the inline marker, and releases the guard.
    pub fn fail(&mut self, error: &str) {
        let Some(active) = self.active.take() else {
            return;
        };
        warn!(local_id = %active.message_local_id, error = %error, "generation failed");
        if !active.superseded {
            let marker = error.to_string();
            self.update(&active.message_local_id, |m| {
                m.delivery_state = DeliveryState::Failed;
                m.error = Some(marker);
            });
        }
        if !self.collaborative {
            self.update(&active.user_local_id, |m| {
                if m.delivery_state == DeliveryState::Pending {
                    m.delivery_state = DeliveryState::Failed;
                }
            });
        }
    }

    /// Teardown: drop any active generation without rendering anything.
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(local_id = %active.message_local_id, "generation aborted");
        }
    }

    // -----------------------------------------------------------------------
    // Broadcasts
    // -----------------------------------------------------------------------

    /// Forget the answer ordering of the previous connection. History from
    /// the next join re-establishes it.
    pub fn reset_live_order(&mut self) {
        self.expected_answers.clear();
    }

    /// Apply one live `chat` frame.
    pub fn on_chat(&mut self, msg: WireMessage) {
        if !self.mark_seen(msg.id.as_deref()) {
            debug!(server_id = ?msg.id, "duplicate chat frame dropped");
            return;
        }
        match msg.role {
            Role::User => match self.match_own_user(&msg, false) {
                Some(idx) => {
                    let local = self.transcript[idx].local_id.clone();
                    self.confirm_local(&local, Some(&msg));
                    let slot = self.unanswered_agent_for(&local);
                    self.expected_answers.push_back(slot);
                }
                None => {
                    self.append_wire(&msg, DeliveryState::Confirmed);
                    self.expected_answers.push_back(None);
                }
            },
            Role::Agent => {
                let slot = match self.expected_answers.pop_front() {
                    Some(slot) => slot,
                    None => self.oldest_unanswered(),
                };
                match slot.filter(|agent| self.is_unanswered(agent)) {
                    Some(agent) => self.merge_answer(&agent, &msg),
                    None => self.append_wire(&msg, DeliveryState::Final),
                }
            }
            Role::System => self.append_wire(&msg, DeliveryState::Final),
        }
    }

    /// Apply the `history` delivered after a join. Already-seen messages are
    /// skipped; an agent answer to one of this client's own questions
    /// completes that exchange instead of rendering a second bubble.
    ///
    /// Questions still unanswered at the end of the history seed the
    /// expected-answer FIFO, so the next live answer lands on the right one.
    pub fn on_history(&mut self, messages: Vec<WireMessage>) {
        let mut questions: VecDeque<Option<LocalId>> = VecDeque::new();
        let mut trailing = 0usize;
        for msg in messages {
            let seen = msg
                .id
                .as_deref()
                .map(|id| self.seen_server_ids.contains(id))
                .unwrap_or(false);
            match msg.role {
                Role::User => {
                    trailing += 1;
                    if seen {
                        let slot = msg.id.as_deref().and_then(|id| self.unanswered_by_server_id(id));
                        questions.push_back(slot);
                        continue;
                    }
                    self.mark_seen(msg.id.as_deref());
                    let slot = match self.match_own_user(&msg, true) {
                        Some(idx) => {
                            let local = self.transcript[idx].local_id.clone();
                            self.confirm_local(&local, Some(&msg));
                            self.unanswered_agent_for(&local)
                        }
                        None => {
                            self.append_wire(&msg, DeliveryState::Confirmed);
                            None
                        }
                    };
                    questions.push_back(slot);
                }
                Role::Agent => {
                    trailing = 0;
                    let target = questions.pop_front().flatten();
                    if seen {
                        continue;
                    }
                    self.mark_seen(msg.id.as_deref());
                    match target.filter(|agent| self.is_unanswered(agent)) {
                        Some(agent) => self.merge_answer(&agent, &msg),
                        None => self.append_wire(&msg, DeliveryState::Final),
                    }
                }
                Role::System => {
                    if !seen {
                        self.mark_seen(msg.id.as_deref());
                        self.append_wire(&msg, DeliveryState::Final);
                    }
                }
            }
        }

        let carried = trailing.min(questions.len());
        let skip = questions.len() - carried;
        self.expected_answers.extend(questions.into_iter().skip(skip));
    }

    /// The `chat` frame for `user_local_id` never reached the server. The
    /// bubble is marked `Failed` and its exchange stops expecting broadcasts.
    pub fn mark_undelivered(&mut self, user_local_id: &LocalId, reason: &str) {
        self.exchanges.retain(|r| &r.user != user_local_id);
        let marker = reason.to_string();
        self.update(user_local_id, |m| {
            if m.delivery_state == DeliveryState::Pending {
                m.delivery_state = DeliveryState::Failed;
                m.error = Some(marker);
            }
        });
    }

    /// Append a local system line (joins, leaves, connection notices).
    pub fn append_system(&mut self, text: impl Into<String>) -> LocalId {
        let msg = Message::system(&self.session_id, text);
        let id = msg.local_id.clone();
        self.append(msg);
        id
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn append(&mut self, msg: Message) {
        self.events.push(TranscriptEvent::Appended(msg.clone()));
        self.transcript.push(msg);
    }

    fn append_wire(&mut self, wire: &WireMessage, state: DeliveryState) {
        let mut msg = Message::new(&self.session_id, wire.role, wire.content.clone(), state);
        msg.sender_participant_id = wire.participant_id.clone();
        msg.sender_nickname = wire.nickname.clone();
        msg.avatar_color = wire.avatar_color.clone();
        msg.server_id = wire.id.clone();
        self.append(msg);
    }

    fn update(&mut self, local_id: &LocalId, f: impl FnOnce(&mut Message)) -> bool {
        let Some(msg) = self.transcript.iter_mut().find(|m| &m.local_id == local_id) else {
            return false;
        };
        let before = msg.clone();
        f(msg);
        if *msg == before {
            return false;
        }
        self.events.push(TranscriptEvent::Updated(msg.clone()));
        true
    }

    /// Returns `false` when `id` was already seen.
    fn mark_seen(&mut self, id: Option<&str>) -> bool {
        match id {
            Some(id) => self.seen_server_ids.insert(id.to_string()),
            None => true,
        }
    }

    /// `Pending -> Confirmed`. A server echo also confirms a message that was
    /// marked `Failed` locally. Returns whether the state changed.
    fn confirm_local(&mut self, local_id: &LocalId, wire: Option<&WireMessage>) -> bool {
        let Some(msg) = self.transcript.iter().find(|m| &m.local_id == local_id) else {
            return false;
        };
        let confirmable = match msg.delivery_state {
            DeliveryState::Pending => true,
            DeliveryState::Failed => wire.is_some(),
            _ => false,
        };
        if !confirmable {
            return false;
        }
        let server_id = wire.and_then(|w| w.id.clone());
        let sender = wire.and_then(|w| w.participant_id.clone());
        self.update(local_id, |m| {
            m.delivery_state = DeliveryState::Confirmed;
            m.error = None;
            if server_id.is_some() {
                m.server_id = server_id;
            }
            if m.sender_participant_id.is_none() {
                m.sender_participant_id = sender;
            }
        });
        true
    }

    /// Index of the local user message `wire` echoes, if any.
    fn match_own_user(&self, wire: &WireMessage, by_nickname: bool) -> Option<usize> {
        if let Some(client_id) = &wire.client_id {
            if let Some(idx) = self
                .transcript
                .iter()
                .position(|m| m.role == Role::User && &m.local_id == client_id)
            {
                return Some(idx);
            }
        }
        let from_self = match (&wire.participant_id, &self.self_id) {
            (Some(sender), Some(me)) => sender == me,
            _ => false,
        } || (by_nickname && wire.nickname.as_deref() == Some(self.identity.nickname.as_str()));
        if !from_self {
            return None;
        }
        let content = wire.content.trim();
        self.transcript.iter().position(|m| {
            m.role == Role::User && m.delivery_state == DeliveryState::Pending && m.content == content
        })
    }

    fn merge_answer(&mut self, agent: &LocalId, wire: &WireMessage) {
        if let Some(record) = self.exchanges.iter_mut().find(|r| &r.agent == agent) {
            record.answered = true;
        }
        if let Some(active) = self.active.as_mut() {
            if &active.message_local_id == agent {
                debug!(local_id = %agent, "broadcast answer supersedes streamed draft");
                active.superseded = true;
            }
        }
        let content = wire.content.clone();
        let server_id = wire.id.clone();
        self.update(agent, |m| {
            m.content = content;
            m.delivery_state = DeliveryState::Final;
            m.error = None;
            m.server_id = server_id;
        });
    }

    fn is_unanswered(&self, agent: &LocalId) -> bool {
        self.exchanges.iter().any(|r| &r.agent == agent && !r.answered)
    }

    fn unanswered_agent_for(&self, user: &LocalId) -> Option<LocalId> {
        self.exchanges
            .iter()
            .find(|r| &r.user == user && !r.answered)
            .map(|r| r.agent.clone())
    }

    fn unanswered_by_server_id(&self, server_id: &str) -> Option<LocalId> {
        let user = self
            .transcript
            .iter()
            .find(|m| m.role == Role::User && m.server_id.as_deref() == Some(server_id))?;
        self.unanswered_agent_for(&user.local_id)
    }

    fn oldest_unanswered(&self) -> Option<LocalId> {
        self.exchanges.iter().find(|r| !r.answered).map(|r| r.agent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(collaborative: bool) -> StreamCoordinator {
        let mut c = StreamCoordinator::new("5", collaborative, Identity::new("ana", "#667eea"));
        c.set_self_id(Some(ParticipantId::from("1")));
        c
    }

    fn wire(id: u32, role: Role, content: &str, from: Option<&str>) -> WireMessage {
        WireMessage {
            id: Some(id.to_string()),
            role,
            content: content.to_string(),
            nickname: from.map(|_| "someone".to_string()),
            avatar_color: None,
            participant_id: from.map(ParticipantId::from),
            created_at: None,
            client_id: None,
        }
    }

    fn count(c: &StreamCoordinator, role: Role) -> usize {
        c.transcript().iter().filter(|m| m.role == role).count()
    }

    #[test]
    fn stream_tokens_build_one_final_bubble() {
        let mut c = coordinator(false);
        let ex = c.submit("hi").unwrap();
        c.apply_chunk(GenerationChunk::Token("Hel".into()));
        c.apply_chunk(GenerationChunk::Token("lo".into()));
        c.apply_chunk(GenerationChunk::Done);

        assert_eq!(count(&c, Role::Agent), 1);
        let agent = c.message(&ex.agent_local_id).unwrap();
        assert_eq!(agent.content, "Hello");
        assert_eq!(agent.delivery_state, DeliveryState::Final);
        assert_eq!(c.message(&ex.user_local_id).unwrap().delivery_state, DeliveryState::Confirmed);
        assert!(!c.is_generating());
    }

    #[test]
    fn failure_keeps_partial_text_and_releases_guard() {
        let mut c = coordinator(false);
        let ex = c.submit("hi").unwrap();
        c.apply_chunk(GenerationChunk::Token("Hel".into()));
        c.fail("HTTP 502 from http://h/api/chat");

        let agent = c.message(&ex.agent_local_id).unwrap();
        assert_eq!(agent.content, "Hel");
        assert_eq!(agent.delivery_state, DeliveryState::Failed);
        assert!(agent.error.as_deref().unwrap().contains("502"));
        assert!(c.submit("again").is_ok());
    }

    #[test]
    fn submit_while_in_flight_is_rejected_without_placeholder() {
        let mut c = coordinator(false);
        c.submit("one").unwrap();
        c.drain_events();
        assert_eq!(c.submit("two"), Err(SubmitError::GenerationInFlight));
        assert_eq!(c.transcript().len(), 2);
        assert!(c.drain_events().is_empty());
    }

    #[test]
    fn empty_submit_is_rejected() {
        let mut c = coordinator(false);
        assert_eq!(c.submit("   "), Err(SubmitError::EmptyContent));
        assert!(c.transcript().is_empty());
    }

    #[test]
    fn stream_end_without_done_keeps_text_as_final() {
        let mut c = coordinator(false);
        let ex = c.submit("hi").unwrap();
        c.apply_chunk(GenerationChunk::Token("partial".into()));
        c.end_of_stream();
        assert_eq!(c.message(&ex.agent_local_id).unwrap().delivery_state, DeliveryState::Final);
        assert!(!c.is_generating());
    }

    #[test]
    fn stream_end_without_any_text_fails() {
        let mut c = coordinator(false);
        let ex = c.submit("hi").unwrap();
        c.end_of_stream();
        let agent = c.message(&ex.agent_local_id).unwrap();
        assert_eq!(agent.delivery_state, DeliveryState::Failed);
        assert!(agent.error.is_some());
        assert!(!c.is_generating());
    }

    #[test]
    fn repeated_citations_merge_by_source() {
        let mut c = coordinator(false);
        let ex = c.submit("hi").unwrap();
        let cite = |source: &str, content: &str| Citation {
            source: source.into(),
            content: content.into(),
            score: None,
            metadata: serde_json::Value::Null,
        };
        c.apply_chunk(GenerationChunk::Citations(vec![cite("a.md", "v1"), cite("b.md", "b")]));
        c.apply_chunk(GenerationChunk::Citations(vec![cite("a.md", "v2")]));
        let citations = &c.message(&ex.agent_local_id).unwrap().citations;
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].content, "v2");
    }

    #[test]
    fn own_echo_confirms_instead_of_rendering() {
        let mut c = coordinator(true);
        let ex = c.submit("hello").unwrap();
        c.on_chat(wire(10, Role::User, "hello", Some("1")));

        assert_eq!(count(&c, Role::User), 1);
        let user = c.message(&ex.user_local_id).unwrap();
        assert_eq!(user.delivery_state, DeliveryState::Confirmed);
        assert_eq!(user.server_id.as_deref(), Some("10"));
    }

    #[test]
    fn client_id_echo_confirms_even_from_other_connection() {
        let mut c = coordinator(true);
        let ex = c.submit("hello").unwrap();
        let mut echo = wire(10, Role::User, "hello", Some("99"));
        echo.client_id = Some(ex.user_local_id.clone());
        c.on_chat(echo);
        assert_eq!(count(&c, Role::User), 1);
    }

    #[test]
    fn same_text_from_another_participant_renders() {
        let mut c = coordinator(true);
        c.submit("hello").unwrap();
        c.on_chat(wire(10, Role::User, "hello", Some("2")));
        assert_eq!(count(&c, Role::User), 2);
    }

    #[test]
    fn duplicate_broadcast_is_dropped() {
        let mut c = coordinator(true);
        c.on_chat(wire(10, Role::User, "hey", Some("2")));
        c.on_chat(wire(10, Role::User, "hey", Some("2")));
        assert_eq!(count(&c, Role::User), 1);
    }

    #[test]
    fn broadcast_answer_supersedes_streamed_draft() {
        let mut c = coordinator(true);
        let ex = c.submit("q").unwrap();
        c.on_chat(wire(10, Role::User, "q", Some("1")));
        c.apply_chunk(GenerationChunk::Token("dra".into()));
        c.on_chat(wire(11, Role::Agent, "final answer", None));

        let agent = c.message(&ex.agent_local_id).unwrap();
        assert_eq!(agent.content, "final answer");
        assert_eq!(agent.delivery_state, DeliveryState::Final);

        // Late tokens are ignored; the guard is still held until the stream ends.
        c.apply_chunk(GenerationChunk::Token("ft".into()));
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "final answer");
        assert!(c.is_generating());
        c.apply_chunk(GenerationChunk::Done);
        assert!(!c.is_generating());
        assert_eq!(count(&c, Role::Agent), 1);
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "final answer");
    }

    #[test]
    fn broadcast_after_stream_completes_replaces_text_once() {
        let mut c = coordinator(true);
        let ex = c.submit("q").unwrap();
        c.on_chat(wire(10, Role::User, "q", Some("1")));
        c.apply_chunk(GenerationChunk::Token("streamed".into()));
        c.apply_chunk(GenerationChunk::Done);
        c.on_chat(wire(11, Role::Agent, "persisted", None));
        assert_eq!(count(&c, Role::Agent), 1);
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "persisted");
    }

    #[test]
    fn answers_to_other_questions_render_separately() {
        let mut c = coordinator(true);
        // Someone else asks first; their answer arrives while ours streams.
        c.on_chat(wire(9, Role::User, "theirs", Some("2")));
        let ex = c.submit("ours").unwrap();
        c.on_chat(wire(10, Role::User, "ours", Some("1")));
        c.on_chat(wire(11, Role::Agent, "answer to theirs", None));
        c.on_chat(wire(12, Role::Agent, "answer to ours", None));

        assert_eq!(count(&c, Role::Agent), 2);
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "answer to ours");
        let other = c
            .transcript()
            .iter()
            .find(|m| m.role == Role::Agent && m.local_id != ex.agent_local_id)
            .unwrap();
        assert_eq!(other.content, "answer to theirs");
    }

    #[test]
    fn failed_bubble_is_completed_by_late_broadcast() {
        let mut c = coordinator(true);
        let ex = c.submit("q").unwrap();
        c.on_chat(wire(10, Role::User, "q", Some("1")));
        c.fail("timed out");
        c.on_chat(wire(11, Role::Agent, "answer", None));
        let agent = c.message(&ex.agent_local_id).unwrap();
        assert_eq!(agent.delivery_state, DeliveryState::Final);
        assert!(agent.error.is_none());
        assert_eq!(count(&c, Role::Agent), 1);
    }

    #[test]
    fn history_renders_once_across_rejoins() {
        let mut c = coordinator(true);
        let history = vec![
            wire(1, Role::User, "q", Some("2")),
            wire(2, Role::Agent, "a", None),
        ];
        c.on_history(history.clone());
        c.on_history(history);
        assert_eq!(c.transcript().len(), 2);
    }

    #[test]
    fn history_completes_exchange_answered_during_outage() {
        let mut c = coordinator(true);
        let ex = c.submit("q").unwrap();
        c.on_chat(wire(10, Role::User, "q", Some("1")));
        c.apply_chunk(GenerationChunk::Done);

        // Reconnected under a new participant id; the answer arrives as history.
        c.set_self_id(Some(ParticipantId::from("7")));
        c.reset_live_order();
        c.on_history(vec![wire(10, Role::User, "q", Some("1")), wire(11, Role::Agent, "a", None)]);

        assert_eq!(count(&c, Role::Agent), 1);
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "a");
    }

    #[test]
    fn history_confirms_pending_message_by_nickname() {
        let mut c = coordinator(true);
        let ex = c.submit("lost echo").unwrap();
        let mut echoed = wire(20, Role::User, "lost echo", Some("1"));
        echoed.participant_id = Some(ParticipantId::from("old"));
        echoed.nickname = Some("ana".into());
        c.on_history(vec![echoed]);
        assert_eq!(count(&c, Role::User), 1);
        assert_eq!(
            c.message(&ex.user_local_id).unwrap().delivery_state,
            DeliveryState::Confirmed
        );
    }

    #[test]
    fn unanswered_question_in_history_keeps_its_own_answer() {
        let mut c = coordinator(true);
        // Someone else's question is still being answered when we join.
        c.on_history(vec![wire(1, Role::User, "their question", Some("2"))]);
        let ex = c.submit("ours").unwrap();
        c.on_chat(wire(2, Role::User, "ours", Some("1")));
        c.apply_chunk(GenerationChunk::Token("our draft".into()));
        c.on_chat(wire(3, Role::Agent, "answer to their question", None));

        let agent = c.message(&ex.agent_local_id).unwrap();
        assert_eq!(agent.content, "our draft");
        assert_eq!(agent.delivery_state, DeliveryState::Streaming);
        assert!(!c.active().unwrap().superseded);
        assert_eq!(count(&c, Role::Agent), 2);

        c.on_chat(wire(4, Role::Agent, "answer to ours", None));
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "answer to ours");
        assert_eq!(count(&c, Role::Agent), 2);
    }

    #[test]
    fn answered_history_does_not_seed_answer_order() {
        let mut c = coordinator(true);
        c.on_history(vec![
            wire(1, Role::User, "q1", Some("2")),
            wire(2, Role::Agent, "a1", None),
        ]);
        let ex = c.submit("ours").unwrap();
        c.on_chat(wire(3, Role::User, "ours", Some("1")));
        c.on_chat(wire(4, Role::Agent, "answer to ours", None));
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "answer to ours");
        assert_eq!(count(&c, Role::Agent), 2);
    }

    #[test]
    fn own_unanswered_question_in_history_receives_live_answer() {
        let mut c = coordinator(true);
        let ex = c.submit("mine").unwrap();
        c.set_self_id(Some(ParticipantId::from("7")));
        c.reset_live_order();
        let mut echoed = wire(5, Role::User, "mine", Some("1"));
        echoed.client_id = Some(ex.user_local_id.clone());
        c.on_history(vec![echoed]);
        c.on_chat(wire(6, Role::Agent, "late answer", None));
        assert_eq!(c.message(&ex.agent_local_id).unwrap().content, "late answer");
        assert_eq!(count(&c, Role::Agent), 1);
    }

    #[test]
    fn undelivered_message_never_claims_a_later_echo_or_answer() {
        let mut c = coordinator(true);
        let first = c.submit("status?").unwrap();
        c.mark_undelivered(&first.user_local_id, "not connected");
        c.apply_chunk(GenerationChunk::Token("first answer".into()));
        c.apply_chunk(GenerationChunk::Done);

        let second = c.submit("status?").unwrap();
        c.on_chat(wire(20, Role::User, "status?", Some("1")));
        c.apply_chunk(GenerationChunk::Token("draft".into()));
        c.on_chat(wire(21, Role::Agent, "second answer", None));

        let first_user = c.message(&first.user_local_id).unwrap();
        assert_eq!(first_user.delivery_state, DeliveryState::Failed);
        assert_eq!(first_user.error.as_deref(), Some("not connected"));
        assert_eq!(c.message(&first.agent_local_id).unwrap().content, "first answer");
        assert_eq!(
            c.message(&second.user_local_id).unwrap().delivery_state,
            DeliveryState::Confirmed
        );
        assert_eq!(c.message(&second.agent_local_id).unwrap().content, "second answer");
        assert_eq!(count(&c, Role::Agent), 2);
    }

    #[test]
    fn echo_of_undelivered_message_confirms_it() {
        let mut c = coordinator(true);
        let ex = c.submit("hello").unwrap();
        c.mark_undelivered(&ex.user_local_id, "send failed");
        let mut echo = wire(30, Role::User, "hello", Some("1"));
        echo.client_id = Some(ex.user_local_id.clone());
        c.on_chat(echo);
        let user = c.message(&ex.user_local_id).unwrap();
        assert_eq!(user.delivery_state, DeliveryState::Confirmed);
        assert!(user.error.is_none());
    }

    #[test]
    fn updates_are_emitted_for_the_same_bubble() {
        let mut c = coordinator(false);
        let ex = c.submit("hi").unwrap();
        let appended = c.drain_events();
        assert_eq!(appended.len(), 2);
        c.apply_chunk(GenerationChunk::Token("a".into()));
        let events = c.drain_events();
        assert!(events.iter().any(
            |e| matches!(e, TranscriptEvent::Updated(m) if m.local_id == ex.agent_local_id && m.content == "a")
        ));
    }

    #[test]
    fn system_lines_append() {
        let mut c = coordinator(true);
        c.append_system("bo joined the session");
        assert_eq!(c.transcript()[0].role, Role::System);
        assert_eq!(c.transcript()[0].delivery_state, DeliveryState::Final);
    }
}
