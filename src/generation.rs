//! Answer generation over HTTP.
//!
//! ## Wire format
//! The private endpoint answers with `text/event-stream`, one JSON payload per
//! `data:` line:
//!
//! ```text
//! data: {"content": "Hel", "done": false}
//! data: {"content": {"type": "trace", "content": [{"content": "...", "metadata": {"source": "faq.md"}}]}, "done": false}
//! data: {"content": "", "done": true}
//! ```
//!
//! The collaborative endpoint may instead answer with a single JSON document
//! `{"status": "success", "content": "..."}`; it is surfaced as one token
//! followed by `Done`, and the authoritative copy arrives as a broadcast.
//!
//! Lines are split on raw bytes before UTF-8 decoding so that a multi-byte
//! character split across network chunks is never mangled.

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::GenerationError;
use crate::model::{Citation, ParticipantId, Session};
use crate::protocol::id_value;

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationChunk {
    Token(String),
    Citations(Vec<Citation>),
    Done,
}

pub type ChunkStream = BoxStream<'static, Result<GenerationChunk, GenerationError>>;

/// Request body shared by both endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub message: String,
    pub conversation_id: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<Value>,
    #[serde(skip)]
    pub collaborative: bool,
}

impl GenerationRequest {
    pub fn for_session(session: &Session, message: &str, participant_id: Option<&ParticipantId>) -> Self {
        let collaborative = session.is_collaborative();
        Self {
            message: message.to_string(),
            conversation_id: session.conversation_id(),
            role: session.role_key.clone(),
            session_id: collaborative.then(|| id_value(&session.id)),
            participant_id: if collaborative {
                participant_id.map(|p| id_value(p.as_str()))
            } else {
                None
            },
            collaborative,
        }
    }
}

/// Something that turns a request into a stream of chunks.
///
/// The returned stream is lazy: nothing happens until it is polled, and
/// dropping it aborts the request.
pub trait GenerationSource: Send + 'static {
    fn open(&self, request: GenerationRequest) -> ChunkStream;
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Interpret one decoded `data:` payload.
///
/// `done` is checked first; a terminal payload that still carries text (the
/// server reports failures that way) yields the text before `Done`.
pub fn parse_payload(value: &Value) -> Vec<GenerationChunk> {
    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
    let mut out = Vec::new();

    match value.get("content") {
        Some(Value::String(text)) if !text.is_empty() => out.push(GenerationChunk::Token(text.clone())),
        Some(Value::Object(inner)) => match inner.get("type").and_then(Value::as_str) {
            Some("trace") => {
                let citations = inner
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(parse_citation).collect::<Vec<_>>())
                    .unwrap_or_default();
                if !citations.is_empty() {
                    out.push(GenerationChunk::Citations(citations));
                }
            }
            _ => {
                if let Some(text) = inner.get("content").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                    out.push(GenerationChunk::Token(text.to_string()));
                }
            }
        },
        _ => {}
    }

    if done {
        out.push(GenerationChunk::Done);
    }
    out
}

fn parse_citation(item: &Value) -> Option<Citation> {
    let content = item
        .get("content")
        .or_else(|| item.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let metadata = item.get("metadata").cloned().unwrap_or(Value::Null);
    let source = metadata
        .get("source")
        .or_else(|| item.get("source"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| (!content.is_empty()).then(|| content.clone()))?;
    Some(Citation {
        source,
        content,
        score: item.get("score").and_then(Value::as_f64),
        metadata,
    })
}

/// Incremental `text/event-stream` line decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes; returns chunks from every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<GenerationChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            out.extend(parse_line(&String::from_utf8_lossy(&line)));
        }
        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<GenerationChunk> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Vec<GenerationChunk> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return vec![GenerationChunk::Done];
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => parse_payload(&value),
        Err(e) => {
            warn!(error = %e, "skipping undecodable stream payload");
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP source
// ---------------------------------------------------------------------------

pub struct HttpGenerationSource {
    client: reqwest::Client,
    private_url: String,
    collaborative_url: String,
}

impl HttpGenerationSource {
    /// Fails only when the HTTP client cannot be built with the configured
    /// timeouts.
    pub fn new(config: &ClientConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.generation.connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(config.generation.request_timeout_secs))
            .build()
            .map_err(|e| GenerationError::Client(e.to_string()))?;
        Ok(Self {
            client,
            private_url: config.chat_url(false),
            collaborative_url: config.chat_url(true),
        })
    }
}

impl GenerationSource for HttpGenerationSource {
    fn open(&self, request: GenerationRequest) -> ChunkStream {
        let url = if request.collaborative {
            self.collaborative_url.clone()
        } else {
            self.private_url.clone()
        };
        let start = Phase::Start {
            client: self.client.clone(),
            url,
            request,
        };
        stream::unfold(start, advance).boxed()
    }
}

enum Phase {
    Start {
        client: reqwest::Client,
        url: String,
        request: GenerationRequest,
    },
    Body {
        body: BoxStream<'static, Result<Vec<u8>, GenerationError>>,
        decoder: SseDecoder,
        ready: VecDeque<GenerationChunk>,
    },
    Drain(VecDeque<GenerationChunk>),
    Finished,
}

async fn advance(mut phase: Phase) -> Option<(Result<GenerationChunk, GenerationError>, Phase)> {
    loop {
        phase = match phase {
            Phase::Finished => return None,
            Phase::Start { client, url, request } => match send(&client, &url, &request).await {
                Ok(next) => next,
                Err(e) => return Some((Err(e), Phase::Finished)),
            },
            Phase::Body {
                mut body,
                mut decoder,
                mut ready,
            } => {
                if let Some(chunk) = ready.pop_front() {
                    return Some((Ok(chunk), Phase::Body { body, decoder, ready }));
                }
                match body.next().await {
                    Some(Ok(bytes)) => {
                        ready.extend(decoder.push(&bytes));
                        Phase::Body { body, decoder, ready }
                    }
                    Some(Err(e)) => return Some((Err(e), Phase::Finished)),
                    None => Phase::Drain(decoder.finish().into()),
                }
            }
            Phase::Drain(mut ready) => {
                return ready.pop_front().map(|chunk| (Ok(chunk), Phase::Drain(ready)));
            }
        };
    }
}

async fn send(client: &reqwest::Client, url: &str, request: &GenerationRequest) -> Result<Phase, GenerationError> {
    debug!(url = %url, conversation_id = %request.conversation_id, role = %request.role, "opening generation stream");
    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(|e| request_error(url, e))?;

    let status = response.status();
    if !status.is_success() {
        warn!(url = %url, status = status.as_u16(), "generation request rejected");
        return Err(GenerationError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        let value: Value = response.json().await.map_err(|e| request_error(url, e))?;
        if value.get("status").and_then(Value::as_str) == Some("error") {
            let detail = value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("server reported an error");
            return Err(GenerationError::Payload(detail.to_string()));
        }
        let mut ready: VecDeque<GenerationChunk> = parse_payload(&value).into();
        if ready.back() != Some(&GenerationChunk::Done) {
            ready.push_back(GenerationChunk::Done);
        }
        return Ok(Phase::Drain(ready));
    }

    let url = url.to_string();
    let body = response
        .bytes_stream()
        .map(move |chunk| chunk.map(|b| b.to_vec()).map_err(|e| request_error(&url, e)))
        .boxed();
    Ok(Phase::Body {
        body,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
    })
}

fn request_error(url: &str, e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else if e.is_connect() {
        GenerationError::Connect {
            url: url.to_string(),
            detail: e.to_string(),
        }
    } else {
        GenerationError::Read(e.to_string())
    }
}
