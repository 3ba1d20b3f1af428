//! Session wire protocol: outbound intents and inbound frames.
//!
//! Frames are JSON text messages. The join handshake is keyed on `action`;
//! everything else is keyed on `type`. Inbound kinds form a closed set:
//! unknown kinds decode to `Ok(None)` and are ignored, while a known kind
//! with the wrong shape is a [`ProtocolError::Malformed`].
//!
//! Ordering the server is expected to honor (not enforced here): `history`
//! arrives once, right after `join_success` and before any live `chat`;
//! `online_users` may interleave with `user_joined` and is merged, never
//! treated as a full replacement.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProtocolError;
use crate::model::{optional_id, now_ms, LocalId, Participant, ParticipantId, Role};

/// Fallback avatar color used when a frame omits one.
pub const DEFAULT_AVATAR_COLOR: &str = "#667eea";

/// Inbound frame kinds this client understands.
pub const KNOWN_KINDS: &[&str] = &[
    "join_success",
    "user_joined",
    "user_left",
    "online_users",
    "history",
    "chat",
    "typing",
    "stop_typing",
    "error",
    "pong",
];

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Join {
        session_id: String,
        nickname: String,
        avatar_color: String,
    },
    Chat {
        content: String,
        /// Echoed back by servers that support client correlation.
        client_id: Option<LocalId>,
    },
    Typing,
    StopTyping,
    Heartbeat,
}

impl Intent {
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Join { .. } => "join",
            Intent::Chat { .. } => "chat",
            Intent::Typing => "typing",
            Intent::StopTyping => "stop_typing",
            Intent::Heartbeat => "ping",
        }
    }
}

/// Ids are integers on the server; keep them numeric on the wire when they
/// look like one.
pub(crate) fn id_value(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

/// Serialize an intent to its wire text.
pub fn encode(intent: &Intent) -> Result<String, ProtocolError> {
    let value = match intent {
        Intent::Join {
            session_id,
            nickname,
            avatar_color,
        } => json!({
            "action": "join",
            "session_id": id_value(session_id),
            "nickname": nickname,
            "avatar_color": avatar_color,
        }),
        Intent::Chat { content, client_id } => match client_id {
            Some(id) => json!({ "type": "chat", "content": content, "client_id": id }),
            None => json!({ "type": "chat", "content": content }),
        },
        Intent::Typing => json!({ "type": "typing" }),
        Intent::StopTyping => json!({ "type": "stop_typing" }),
        Intent::Heartbeat => json!({ "type": "ping" }),
    };
    serde_json::to_string(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireParticipant {
    pub participant_id: ParticipantId,
    pub nickname: String,
    #[serde(default)]
    pub avatar_color: Option<String>,
}

impl WireParticipant {
    pub fn into_participant(self) -> Participant {
        Participant {
            participant_id: self.participant_id,
            nickname: self.nickname,
            avatar_color: self
                .avatar_color
                .unwrap_or_else(|| DEFAULT_AVATAR_COLOR.to_string()),
            joined_at: now_ms(),
        }
    }
}

/// A persisted chat message as the server serializes it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireMessage {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar_color: Option<String>,
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub client_id: Option<LocalId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    JoinSuccess {
        participant_id: ParticipantId,
        nickname: String,
    },
    UserJoined(WireParticipant),
    UserLeft {
        participant_id: ParticipantId,
        #[serde(default)]
        nickname: String,
    },
    OnlineUsers {
        users: Vec<WireParticipant>,
    },
    History {
        messages: Vec<WireMessage>,
    },
    Chat {
        message: WireMessage,
    },
    Typing {
        participant_id: ParticipantId,
        #[serde(default)]
        nickname: String,
    },
    StopTyping {
        participant_id: ParticipantId,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for well-formed frames of a kind outside [`KNOWN_KINDS`].
pub fn decode(text: &str) -> Result<Option<ServerFrame>, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        debug!(kind = %kind, "ignoring unknown frame kind");
        return Ok(None);
    }

    serde_json::from_value::<ServerFrame>(value)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed {
            kind,
            detail: e.to_string(),
        })
}
