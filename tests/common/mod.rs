//! Shared fixtures: a scripted generation source and event helpers.

#![allow(dead_code)]

use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use huddle::{
    ChunkStream, ClientConfig, GenerationChunk, GenerationError, GenerationRequest, GenerationSource, Identity,
    MemoryConnector, MemoryListener, MemoryPeer, Session, SessionClient, SessionEvent, SessionKind,
};

/// One `open()` call seen by [`ScriptedGeneration`]. Push chunks through
/// `chunks`; dropping it ends the stream.
pub struct OpenedStream {
    pub request: GenerationRequest,
    pub chunks: mpsc::UnboundedSender<Result<GenerationChunk, GenerationError>>,
}

impl OpenedStream {
    pub fn token(&self, text: &str) {
        let _ = self.chunks.send(Ok(GenerationChunk::Token(text.to_string())));
    }

    pub fn done(&self) {
        let _ = self.chunks.send(Ok(GenerationChunk::Done));
    }

    pub fn fail(&self, error: GenerationError) {
        let _ = self.chunks.send(Err(error));
    }
}

pub struct ScriptedGeneration {
    opened: mpsc::UnboundedSender<OpenedStream>,
}

impl ScriptedGeneration {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OpenedStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { opened: tx }, rx)
    }
}

impl GenerationSource for ScriptedGeneration {
    fn open(&self, request: GenerationRequest) -> ChunkStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(OpenedStream { request, chunks: tx });
        UnboundedReceiverStream::new(rx).boxed()
    }
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.server.ws_url = "ws://memory.test".to_string();
    config.heartbeat.interval_ms = 0;
    config
}

pub struct Harness {
    pub client: SessionClient,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub connector: MemoryConnector,
    pub listener: MemoryListener,
    pub streams: mpsc::UnboundedReceiver<OpenedStream>,
}

pub fn start(kind: SessionKind, config: ClientConfig) -> Harness {
    start_with(kind, config, |_| {})
}

/// Like [`start`], with a hook to script the connector before the first dial.
pub fn start_with(kind: SessionKind, config: ClientConfig, prepare: impl FnOnce(&MemoryConnector)) -> Harness {
    let (connector, listener) = MemoryConnector::new();
    prepare(&connector);
    let (generation, streams) = ScriptedGeneration::new();
    let session = Session::new("12", kind, "launch review");
    let (client, events) = SessionClient::create(
        &config,
        session,
        Identity::new("ana", "#58a6ff"),
        connector.clone(),
        generation,
    );
    Harness {
        client,
        events,
        connector,
        listener,
        streams,
    }
}

impl Harness {
    /// Accept the next connection and consume its join frame.
    pub async fn accept_joined(&mut self, participant_id: u32) -> MemoryPeer {
        let mut peer = within(self.listener.accept()).await.expect("client never dialed");
        let join = within(peer.recv_json()).await.expect("no join frame");
        assert_eq!(join["action"], "join");
        peer.send_json(serde_json::json!({
            "type": "join_success",
            "participant_id": participant_id,
            "nickname": "ana",
        }));
        peer
    }

    pub async fn next_stream(&mut self) -> OpenedStream {
        within(self.streams.recv()).await.expect("no generation stream opened")
    }

    /// Wait for the first event matching `pred`, discarding the rest.
    pub async fn expect(&mut self, pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        self.collect_until(pred).await.pop().expect("collect_until returns at least one event")
    }

    /// All events up to and including the first one matching `pred`.
    pub async fn collect_until(&mut self, mut pred: impl FnMut(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let events = &mut self.events;
        within(async move {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Some(event) => {
                        let done = pred(&event);
                        seen.push(event);
                        if done {
                            return seen;
                        }
                    }
                    None => panic!("event stream closed; saw {seen:?}"),
                }
            }
        })
        .await
    }
}

/// Bound a wait so a missing event fails the test instead of hanging it.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(600), fut)
        .await
        .expect("timed out waiting")
}
