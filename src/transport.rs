//! Concrete transports behind [`Connector`].
//!
//! [`WsConnector`] speaks WebSocket via tokio-tungstenite. [`MemoryConnector`]
//! is an in-process pair of channels with the same semantics, used to run a
//! session against a scripted server.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::connection::{Connector, FrameConnection};
use crate::error::TransportError;

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for WsConnector {
    type Connection = WsConnection;

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WsConnection, TransportError>> {
        let url = url.to_string();
        let timeout = self.connect_timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
                Ok(Ok((stream, _response))) => Ok(WsConnection { stream }),
                Ok(Err(e)) => Err(TransportError::Connect {
                    url,
                    detail: e.to_string(),
                }),
                Err(_) => Err(TransportError::Connect {
                    url,
                    detail: format!("timed out after {}s", timeout.as_secs()),
                }),
            }
        })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FrameConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text)),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(TransportError::Receive(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "close handshake failed");
        }
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    refusals: u32,
    dials: u32,
}

/// Connector whose connections terminate in a [`MemoryPeer`] handed out by
/// the paired [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (MemoryConnector, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                state: Arc::new(Mutex::new(MemoryState::default())),
                accepted: tx,
            },
            MemoryListener { accepted: rx },
        )
    }

    /// Make the next `n` dials fail.
    pub fn refuse_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.refusals += n;
        }
    }

    /// Dials attempted so far, refused ones included.
    pub fn dial_count(&self) -> u32 {
        self.state.lock().map(|s| s.dials).unwrap_or(0)
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<MemoryConnection, TransportError>> {
        let refused = match self.state.lock() {
            Ok(mut state) => {
                state.dials += 1;
                if state.refusals > 0 {
                    state.refusals -= 1;
                    true
                } else {
                    false
                }
            }
            Err(_) => true,
        };
        let url = url.to_string();
        let accepted = self.accepted.clone();
        Box::pin(async move {
            if refused {
                return Err(TransportError::Connect {
                    url,
                    detail: "connection refused".into(),
                });
            }
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let (client_tx, from_client) = mpsc::unbounded_channel();
            accepted
                .send(MemoryPeer {
                    to_client,
                    from_client,
                    pushed_back: VecDeque::new(),
                })
                .map_err(|_| TransportError::Connect {
                    url,
                    detail: "listener dropped".into(),
                })?;
            Ok(MemoryConnection {
                inbound: client_rx,
                outbound: client_tx,
            })
        })
    }
}

impl MemoryListener {
    /// Next accepted connection, in dial order.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.try_recv().ok()
    }
}

/// Client side of an in-process connection.
pub struct MemoryConnection {
    inbound: mpsc::UnboundedReceiver<Result<String, String>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl FrameConnection for MemoryConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound
            .recv()
            .await
            .map(|frame| frame.map_err(TransportError::Receive))
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server side of an in-process connection. Dropping it closes the connection.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Result<String, String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    pushed_back: VecDeque<String>,
}

impl MemoryPeer {
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Ok(text.into()));
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.send(value.to_string());
    }

    /// Deliver a transport error to the client.
    pub fn fail(&self, detail: impl Into<String>) {
        let _ = self.to_client.send(Err(detail.into()));
    }

    /// Stop accepting client frames while still delivering to the client, so
    /// the client's next send fails.
    pub fn stop_reading(&mut self) {
        self.from_client.close();
    }

    /// Next frame the client sent; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        if let Some(text) = self.pushed_back.pop_front() {
            return Some(text);
        }
        self.from_client.recv().await
    }

    /// Next client frame parsed as JSON, skipping anything that is not.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            let text = self.recv().await?;
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
    }

    /// Next client frame whose `type` (or `action`) equals `kind`; earlier
    /// frames of other kinds are kept for later `recv` calls.
    pub async fn recv_kind(&mut self, kind: &str) -> Option<serde_json::Value> {
        let mut skipped = Vec::new();
        let found = loop {
            let Some(text) = self.from_client.recv().await else {
                break None;
            };
            let value: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => {
                    skipped.push(text);
                    continue;
                }
            };
            let this_kind = value
                .get("type")
                .or_else(|| value.get("action"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if this_kind == kind {
                break Some(value);
            }
            skipped.push(text);
        };
        self.pushed_back.extend(skipped);
        found
    }

    /// Frames the client has sent that were not consumed yet.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out: Vec<String> = self.pushed_back.drain(..).collect();
        while let Ok(text) = self.from_client.try_recv() {
            out.push(text);
        }
        out
    }
}
