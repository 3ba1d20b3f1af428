//! Client-side session layer for a collaborative chat assistant.
//!
//! A [`SessionClient`] owns one session: a reconnecting WebSocket connection
//! speaking the session protocol (join, presence, chat, typing, heartbeat), a
//! presence roster, typing indicators, and a [`StreamCoordinator`] that merges
//! the optimistic local echo, server broadcasts and the streamed HTTP answer
//! into exactly one bubble per message.
//!
//! ```no_run
//! use huddle::{ClientConfig, HttpGenerationSource, Identity, Session, SessionClient, SessionKind, WsConnector};
//!
//! # async fn demo() -> huddle::Result<()> {
//! let config = ClientConfig::default();
//! let session = Session::new("12", SessionKind::Collaborative, "launch review");
//! let (client, mut events) = SessionClient::create(
//!     &config,
//!     session,
//!     Identity::new("ana", "#58a6ff"),
//!     WsConnector::default(),
//!     HttpGenerationSource::new(&config)?,
//! );
//! let _ = client.submit("What changed since yesterday?").await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod generation;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod transport;
pub mod typing;

pub use client::{NoticeLevel, SessionClient, SessionEvent, TypingPeer};
pub use config::ClientConfig;
pub use connection::{CloseReason, ConnectionManager, ConnectionState, Connector, FrameConnection, LinkEvent, ReconnectPolicy};
pub use coordinator::{StreamCoordinator, TranscriptEvent};
pub use error::{ConfigError, GenerationError, HuddleError, ProtocolError, Result, SubmitError, TransportError};
pub use generation::{ChunkStream, GenerationChunk, GenerationRequest, GenerationSource, HttpGenerationSource};
pub use model::{
    Citation, DeliveryState, Identity, LocalId, Message, Participant, ParticipantId, Role, Session, SessionKind,
};
pub use presence::PresenceRegistry;
pub use transport::{MemoryConnector, MemoryListener, MemoryPeer, WsConnector};
pub use typing::TypingTracker;
