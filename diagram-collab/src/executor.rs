//! Graph mutation seam.
//!
//! The history engine and remote-operation handling describe changes as
//! [`GraphOperation`]s; an [`OperationExecutor`] applies them to whatever
//! graph the application owns. [`SharedGraph`] is the in-memory one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use diagram_core::{Cell, CellOperation, CoreError, GraphOperation, InMemoryGraph};
use thiserror::Error;

/// Where an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationSource {
    /// A local user edit.
    UserInteraction,
    /// Replay of a history entry.
    UndoRedo,
    /// A change received from another participant.
    RemoteCollaboration,
}

/// Context passed alongside operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Origin of the operations.
    pub source: OperationSource,
    /// History entry or server operation ID the operations belong to.
    pub correlation_id: Option<String>,
    /// Whether the executor must not record the change as a new history entry.
    pub suppress_history: bool,
}

impl OperationContext {
    /// Context for undo/redo of a history entry.
    #[must_use]
    pub fn undo_redo(entry_id: impl Into<String>) -> Self {
        Self {
            source: OperationSource::UndoRedo,
            correlation_id: Some(entry_id.into()),
            suppress_history: true,
        }
    }

    /// Context for a change received from a peer.
    #[must_use]
    pub fn remote(operation_id: impl Into<String>) -> Self {
        Self {
            source: OperationSource::RemoteCollaboration,
            correlation_id: Some(operation_id.into()),
            suppress_history: true,
        }
    }

    /// Context for a local edit.
    #[must_use]
    pub fn user() -> Self {
        Self {
            source: OperationSource::UserInteraction,
            correlation_id: None,
            suppress_history: false,
        }
    }
}

/// Successful execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Cells touched, in operation order.
    pub affected_ids: Vec<String>,
}

/// Failed execution.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The graph refused the operations.
    #[error("graph rejected operations: {0}")]
    Rejected(String),
    /// The executor is not able to run right now.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

impl From<CoreError> for ExecutionError {
    fn from(err: CoreError) -> Self {
        Self::Rejected(err.to_string())
    }
}

/// Applies graph operations.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Apply `operations` in order, all or nothing.
    async fn execute(
        &self,
        operations: Vec<GraphOperation>,
        context: &OperationContext,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// An [`InMemoryGraph`] behind a mutex, shareable across tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedGraph {
    inner: Arc<Mutex<InMemoryGraph>>,
}

impl SharedGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph seeded from a snapshot.
    #[must_use]
    pub fn from_cells(cells: impl IntoIterator<Item = Cell>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(InMemoryGraph::from_cells(cells))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryGraph> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole graph.
    pub fn replace(&self, cells: impl IntoIterator<Item = Cell>) {
        *self.lock() = InMemoryGraph::from_cells(cells);
    }

    /// Look up a cell.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Cell> {
        self.lock().get(id).cloned()
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All cells in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Cell> {
        self.lock().snapshot()
    }
}

#[async_trait]
impl OperationExecutor for SharedGraph {
    async fn execute(
        &self,
        operations: Vec<GraphOperation>,
        context: &OperationContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        let affected_ids = self.lock().apply(&operations)?;
        tracing::trace!(
            source = ?context.source,
            correlation_id = ?context.correlation_id,
            count = affected_ids.len(),
            "Applied graph operations"
        );
        Ok(ExecutionResult { affected_ids })
    }
}

/// Apply a peer's cell operations through `executor`.
///
/// # Errors
///
/// Returns the executor's error; malformed operations are dropped before
/// execution.
pub async fn apply_remote_operations(
    executor: &dyn OperationExecutor,
    operation_id: &str,
    cells: &[CellOperation],
) -> Result<ExecutionResult, ExecutionError> {
    let operations = GraphOperation::from_cell_operations(cells);
    if operations.is_empty() {
        return Ok(ExecutionResult::default());
    }
    executor
        .execute(operations, &OperationContext::remote(operation_id))
        .await
}
