//! Error taxonomy.
//!
//! Transport, protocol and generation errors inside a running session are
//! absorbed where they occur and turned into session events. Setup failures
//! (config, HTTP client construction, terminal I/O) reach the caller as
//! [`HuddleError`].

use thiserror::Error;

/// The socket could not be opened, or an open socket failed.
///
/// Always non-fatal: it feeds the reconnect policy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {detail}")]
    Connect { url: String, detail: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("heartbeat unanswered after {0} ms")]
    HeartbeatTimeout(u64),
    #[error("not connected")]
    NotConnected,
}

/// An inbound frame could not be understood, or the server reported an error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` frame: {detail}")]
    Malformed { kind: String, detail: String },
    #[error("server error: {0}")]
    Server(String),
    #[error("could not encode frame: {0}")]
    Encode(String),
}

/// The answer-generation request failed; scoped to one message bubble.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request to {url} failed: {detail}")]
    Connect { url: String, detail: String },
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("generation timed out")]
    Timeout,
    #[error("malformed stream payload: {0}")]
    Payload(String),
    #[error("cannot build HTTP client: {0}")]
    Client(String),
}

/// Why a `submit()` call was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("an answer is already being generated")]
    GenerationInFlight,
    #[error("message is empty")]
    EmptyContent,
    #[error("session is closed")]
    SessionClosed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum HuddleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = HuddleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display_names_url() {
        let e = TransportError::Connect {
            url: "ws://x:5001".into(),
            detail: "refused".into(),
        };
        assert_eq!(e.to_string(), "connect to ws://x:5001 failed: refused");
    }

    #[test]
    fn huddle_error_is_transparent() {
        let e: HuddleError = SubmitError::GenerationInFlight.into();
        assert_eq!(e.to_string(), "an answer is already being generated");
    }

    #[test]
    fn setup_errors_convert_into_huddle_error() {
        fn build() -> Result<()> {
            let client: std::result::Result<(), GenerationError> =
                Err(GenerationError::Client("no TLS backend".into()));
            client?;
            Ok(())
        }
        let e = build().unwrap_err();
        assert!(matches!(e, HuddleError::Generation(GenerationError::Client(_))));
        assert_eq!(e.to_string(), "cannot build HTTP client: no TLS backend");
    }

    #[test]
    fn generation_http_display() {
        let e = GenerationError::Http {
            status: 502,
            url: "http://h/api/chat".into(),
        };
        assert_eq!(e.to_string(), "HTTP 502 from http://h/api/chat");
    }
}
