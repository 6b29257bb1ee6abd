//! # Diagram Collab
//!
//! Async collaboration layer for diagram editing sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       diagram-collab                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ConnectionManager  ◄── WebSocketConnector (tungstenite)     │
//! │   - state machine, backoff reconnect                         │
//! │   - ACK tracking, request/response correlation               │
//! │   - MessageChunker (split / reassemble large payloads)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  HistoryEngine ──events──► PersistenceArbitrator             │
//! │   - bounded undo/redo       - diff + coalesce + debounce     │
//! │   - OperationExecutor       - PushStrategy | RestStrategy    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cell models, diffing and the history stacks come from `diagram-core`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod chunker;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod history;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod redact;
pub mod transport;
pub mod validation;

pub use auth::{StaticTokenProvider, TokenError, TokenProvider};
pub use chunker::{ChunkError, ChunkInfo, ChunkedMessage, MessageChunker};
pub use config::{
    ApiConfig, BatchConfig, ChunkConfig, CollabConfig, ConnectionConfig, ReconnectConfig,
};
pub use connection::{
    ConnectionErrorEvent, ConnectionEvent, ConnectionManager, ConnectionState, Severity,
};
pub use error::{SyncError, SyncResult};
pub use executor::{
    apply_remote_operations, ExecutionError, ExecutionResult, OperationContext,
    OperationExecutor, OperationSource, SharedGraph,
};
pub use history::{HistoryEngine, HistoryError, HistoryEvent, HistoryEventKind};
pub use message::{
    CellPatch, CursorPosition, DomainMessage, InboundMessage, Message, MessageType, Participant,
    User,
};
pub use persistence::{
    ArbitratorHandle, DiagramApiClient, DiagramDocument, HistoryDirection, LoadRequest,
    PersistenceArbitrator, PersistenceError, PersistenceEvent, PersistenceStrategy,
    PersistenceTarget, PushStrategy, RestStrategy, SavePayload, SaveRequest, SaveResult,
    SnapshotSource, TeardownPolicy,
};
pub use transport::{session_url, Connector, WebSocketConnector};

/// Diagram collab version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
