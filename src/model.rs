//! Session data model: sessions, participants, transcript messages and the ids
//! that tie them together.
//!
//! Everything here is owned by exactly one `SessionClient`; nothing is shared
//! across sessions.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Avatar colors offered when the user has not picked one.
pub const AVATAR_COLORS: &[&str] = &[
    "#667eea", "#58a6ff", "#f0883e", "#a371f7", "#3fb950", "#e3b341", "#f85149",
];

/// Role keys the assistant understands.
pub const ROLE_KEYS: &[&str] = &[
    "product_manager",
    "tech_developer",
    "sales_operations",
    "default_engineer",
];

pub const DEFAULT_ROLE_KEY: &str = "default_engineer";

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pick a random avatar color from [`AVATAR_COLORS`].
pub fn random_avatar_color() -> String {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..AVATAR_COLORS.len());
    AVATAR_COLORS[idx].to_string()
}

/// Whether `key` is one of the known [`ROLE_KEYS`].
pub fn is_known_role(key: &str) -> bool {
    ROLE_KEYS.contains(&key)
}

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Client-assigned message id; the sole de-duplication key of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        LocalId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LocalId {
    fn from(s: &str) -> Self {
        LocalId(s.to_string())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned participant id. The server emits integers; older builds
/// emitted strings, so both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        ParticipantId(s.to_string())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        RawId::deserialize(d).map(|raw| ParticipantId(raw.into()))
    }
}

/// Deserialize an optional string-or-integer id (`null` and absent both map to `None`).
pub(crate) fn optional_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Option::<RawId>::deserialize(d).map(|raw| raw.map(String::from))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Private,
    Collaborative,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Private => write!(f, "private"),
            SessionKind::Collaborative => write!(f, "collaborative"),
        }
    }
}

/// A chat session. Only `role_key` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub display_name: String,
    pub role_key: String,
}

impl Session {
    pub fn new(id: impl Into<String>, kind: SessionKind, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: display_name.into(),
            role_key: DEFAULT_ROLE_KEY.to_string(),
        }
    }

    pub fn is_collaborative(&self) -> bool {
        self.kind == SessionKind::Collaborative
    }

    /// Conversation id the generation endpoint keys its memory on.
    pub fn conversation_id(&self) -> String {
        format!("session_{}", self.id)
    }
}

/// How this client presents itself when joining a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub nickname: String,
    pub avatar_color: String,
}

impl Identity {
    pub fn new(nickname: impl Into<String>, avatar_color: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            avatar_color: avatar_color.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A participant currently present in a collaborative session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub nickname: String,
    pub avatar_color: String,
    pub joined_at: u64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
            Role::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryState {
    /// Rendered optimistically, not yet echoed by the server.
    Pending,
    Confirmed,
    Streaming,
    Final,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Confirmed | DeliveryState::Final | DeliveryState::Failed)
    }
}

/// A retrieval citation attached to an agent answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// Merge key: repeated citations for the same source update in place.
    pub source: String,
    pub content: String,
    pub score: Option<f64>,
    pub metadata: serde_json::Value,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub local_id: LocalId,
    pub session_id: String,
    pub role: Role,
    pub sender_participant_id: Option<ParticipantId>,
    pub sender_nickname: Option<String>,
    pub avatar_color: Option<String>,
    pub content: String,
    pub created_at: u64,
    pub delivery_state: DeliveryState,
    /// Id assigned by the server once the message has been persisted.
    pub server_id: Option<String>,
    pub citations: Vec<Citation>,
    /// Inline error marker shown on a failed bubble.
    pub error: Option<String>,
}

impl Message {
    pub fn new(session_id: &str, role: Role, content: impl Into<String>, state: DeliveryState) -> Self {
        Self {
            local_id: LocalId::generate(),
            session_id: session_id.to_string(),
            role,
            sender_participant_id: None,
            sender_nickname: None,
            avatar_color: None,
            content: content.into(),
            created_at: now_ms(),
            delivery_state: state,
            server_id: None,
            citations: Vec::new(),
            error: None,
        }
    }

    pub fn system(session_id: &str, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::System, text, DeliveryState::Final)
    }
}
