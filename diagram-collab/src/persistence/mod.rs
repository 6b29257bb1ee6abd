//! Persistence: how local edits reach storage and other participants.
//!
//! Two strategies sit behind [`PersistenceStrategy`]:
//!
//! - [`PushStrategy`] sends diffed cell operations over the live connection;
//! - [`RestStrategy`] saves and loads whole snapshots over HTTP.
//!
//! [`PersistenceArbitrator`] batches history events and picks a strategy per
//! flush.

mod arbitrator;
mod push;
mod rest;

pub use arbitrator::{
    ArbitratorHandle, PersistenceArbitrator, PersistenceEvent, PersistenceTarget, TeardownPolicy,
};
pub use push::PushStrategy;
pub use rest::{ApiError, DiagramApiClient, DiagramDocument, RestStrategy};

use async_trait::async_trait;
use diagram_core::{Cell, CellOperation};
use thiserror::Error;

use crate::error::SyncError;

/// Direction of a collaborative history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryDirection {
    /// Undo the session's last change.
    Undo,
    /// Redo the session's last undone change.
    Redo,
}

/// What a save carries.
#[derive(Debug, Clone, PartialEq)]
pub enum SavePayload {
    /// Diffed, coalesced operations (push only).
    Operations(Vec<CellOperation>),
    /// The full current diagram (request/response only).
    Snapshot(Vec<Cell>),
    /// A collaborative undo/redo. Rejected by every `save`.
    History(HistoryDirection),
}

impl SavePayload {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Operations(_) => "operations",
            Self::Snapshot(_) => "snapshot",
            Self::History(_) => "history",
        }
    }
}

/// A save request.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    /// Owning threat model; required by the REST API.
    pub threat_model_id: Option<String>,
    /// Target diagram.
    pub diagram_id: String,
    /// Content.
    pub payload: SavePayload,
}

/// Outcome of a save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveResult {
    /// Server update vector after the save (REST).
    pub update_vector: Option<u64>,
    /// Cells as stored by the server (REST).
    pub cells: Option<Vec<Cell>>,
    /// ID of the broadcast operation (push).
    pub operation_id: Option<String>,
}

/// A load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// Owning threat model; required by the REST API.
    pub threat_model_id: Option<String>,
    /// Diagram to load.
    pub diagram_id: String,
}

/// Persistence failures.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The REST API needs a threat model ID and none was given.
    #[error("threat model ID is required")]
    MissingThreatModelId,
    /// The strategy cannot perform this operation.
    #[error("{strategy} persistence does not support {operation}: {hint}")]
    Unsupported {
        /// Strategy name.
        strategy: &'static str,
        /// What was attempted.
        operation: &'static str,
        /// What to do instead.
        hint: &'static str,
    },
    /// The push transport failed.
    #[error("push failed: {0}")]
    Sync(#[from] SyncError),
    /// The REST API failed.
    #[error("API request failed: {0}")]
    Api(String),
}

/// A way of persisting diagram changes.
#[async_trait]
pub trait PersistenceStrategy: Send + Sync {
    /// Name used in logs, metrics and errors.
    fn name(&self) -> &'static str;

    /// Whether the strategy can be used right now.
    fn is_available(&self) -> bool {
        true
    }

    /// Persist `request`.
    async fn save(&self, request: SaveRequest) -> Result<SaveResult, PersistenceError>;

    /// Load a diagram.
    async fn load(&self, request: LoadRequest) -> Result<DiagramDocument, PersistenceError>;
}

/// Source of the current full diagram, for snapshot saves.
pub trait SnapshotSource: Send + Sync {
    /// Every cell of the current diagram.
    fn snapshot(&self) -> Vec<Cell>;
}

impl SnapshotSource for crate::executor::SharedGraph {
    fn snapshot(&self) -> Vec<Cell> {
        crate::executor::SharedGraph::snapshot(self)
    }
}
