//! Undo/redo engine.
//!
//! Owns the bounded stacks from `diagram-core` and replays entries through an
//! [`OperationExecutor`]. Observers subscribe to [`HistoryEvent`]s; the
//! persistence arbitrator is one of them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diagram_core::{HistoryEntry, HistoryState, HistoryStatus};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::executor::{OperationContext, OperationExecutor};
use crate::metrics;

const EVENT_CAPACITY: usize = 256;

/// What produced a [`HistoryEvent::Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryEventKind {
    /// A new edit was recorded.
    Add,
    /// An entry was undone.
    Undo,
    /// An entry was redone.
    Redo,
}

impl HistoryEventKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

/// Emitted after every history change.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    /// Stack sizes changed.
    StateChanged(HistoryStatus),
    /// An entry was added, undone or redone.
    Operation {
        /// Which action.
        kind: HistoryEventKind,
        /// The entry involved.
        entry: HistoryEntry,
        /// Whether execution succeeded.
        success: bool,
    },
}

/// Undo/redo failures. Stacks are unchanged when one is returned.
#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    /// The undo stack is empty.
    #[error("nothing to undo")]
    NothingToUndo,
    /// The redo stack is empty.
    #[error("nothing to redo")]
    NothingToRedo,
    /// No undoable entry carries the correlation ID.
    #[error("no history entry tagged with {0}")]
    EntryNotFound(String),
    /// The executor refused the entry's operations.
    #[error("executing entry {entry_id} failed: {reason}")]
    ExecutionFailed {
        /// Entry that was restored.
        entry_id: String,
        /// Executor message.
        reason: String,
    },
    /// `undo_until` stopped early.
    #[error("undo stopped after {completed} of {requested} steps: {source}")]
    Partial {
        /// Undos that succeeded.
        completed: usize,
        /// Undos that were needed.
        requested: usize,
        /// What stopped it.
        source: Box<HistoryError>,
    },
}

/// Bounded undo/redo over an operation executor.
pub struct HistoryEngine {
    state: Mutex<HistoryState>,
    executor: Arc<dyn OperationExecutor>,
    events: broadcast::Sender<HistoryEvent>,
    // Serializes adds, undos and redos so none lands mid-replay.
    replay: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl HistoryEngine {
    /// Create an engine whose stacks hold at most `max_stack_size` entries.
    #[must_use]
    pub fn new(executor: Arc<dyn OperationExecutor>, max_stack_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(HistoryState::new(max_stack_size)),
            executor,
            events,
            replay: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: HistoryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self) {
        let status = self.status();
        self.emit(HistoryEvent::StateChanged(status));
    }

    /// Observe history changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// Current stack summary.
    #[must_use]
    pub fn status(&self) -> HistoryStatus {
        self.lock().status()
    }

    /// Copy of the stacks.
    #[must_use]
    pub fn state(&self) -> HistoryState {
        self.lock().clone()
    }

    /// Whether an undo is possible.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.lock().can_undo()
    }

    /// Whether a redo is possible.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.lock().can_redo()
    }

    /// Record an edit the graph has already applied.
    ///
    /// Clears the redo stack and evicts the oldest entry on overflow. Waits
    /// for an in-flight undo or redo to finish first.
    pub async fn add_entry(&self, entry: HistoryEntry) {
        let _replay = self.replay.lock().await;
        let evicted = self.lock().push(entry.clone());
        if let Some(evicted) = evicted {
            tracing::debug!(entry_id = %evicted.id, "Evicted oldest history entry");
        }
        tracing::debug!(entry_id = %entry.id, operation = ?entry.operation_type, "Recorded history entry");
        self.emit(HistoryEvent::Operation {
            kind: HistoryEventKind::Add,
            entry,
            success: true,
        });
        self.emit_status();
    }

    /// Revert the most recent entry.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::NothingToUndo`] on an empty stack, or
    /// [`HistoryError::ExecutionFailed`] after restoring the entry.
    pub async fn undo(&self) -> Result<HistoryEntry, HistoryError> {
        let _replay = self.replay.lock().await;
        self.undo_step().await
    }

    async fn undo_step(&self) -> Result<HistoryEntry, HistoryError> {
        let entry = self.lock().pop_undo().ok_or(HistoryError::NothingToUndo)?;
        let operations = entry.undo_graph_operations();
        let result = self
            .executor
            .execute(operations, &OperationContext::undo_redo(&entry.id))
            .await;

        match result {
            Ok(_) => {
                self.lock().push_redo(entry.clone());
                self.finish(HistoryEventKind::Undo, entry.clone(), true);
                Ok(entry)
            }
            Err(e) => {
                self.lock().push_undo_keep_redo(entry.clone());
                tracing::warn!(entry_id = %entry.id, error = %e, "Undo failed; entry restored");
                let entry_id = entry.id.clone();
                self.finish(HistoryEventKind::Undo, entry, false);
                Err(HistoryError::ExecutionFailed {
                    entry_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Re-apply the most recently undone entry.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::NothingToRedo`] on an empty stack, or
    /// [`HistoryError::ExecutionFailed`] after restoring the entry.
    pub async fn redo(&self) -> Result<HistoryEntry, HistoryError> {
        let _replay = self.replay.lock().await;
        let entry = self.lock().pop_redo().ok_or(HistoryError::NothingToRedo)?;
        let operations = entry.redo_graph_operations();
        let result = self
            .executor
            .execute(operations, &OperationContext::undo_redo(&entry.id))
            .await;

        match result {
            Ok(_) => {
                self.lock().push_undo_keep_redo(entry.clone());
                self.finish(HistoryEventKind::Redo, entry.clone(), true);
                Ok(entry)
            }
            Err(e) => {
                self.lock().push_redo(entry.clone());
                tracing::warn!(entry_id = %entry.id, error = %e, "Redo failed; entry restored");
                let entry_id = entry.id.clone();
                self.finish(HistoryEventKind::Redo, entry, false);
                Err(HistoryError::ExecutionFailed {
                    entry_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn finish(&self, kind: HistoryEventKind, entry: HistoryEntry, success: bool) {
        metrics::record_history_operation(kind.as_str(), success);
        self.emit(HistoryEvent::Operation {
            kind,
            entry,
            success,
        });
        self.emit_status();
    }

    /// Undo down to and including the entry tagged `correlation_id`.
    ///
    /// Undos run one at a time; returns how many were performed.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::EntryNotFound`] if no undoable entry has the
    /// tag, or [`HistoryError::Partial`] with the number of completed undos
    /// if one fails midway.
    pub async fn undo_until(&self, correlation_id: &str) -> Result<usize, HistoryError> {
        let _replay = self.replay.lock().await;
        let requested = self
            .lock()
            .undos_to_reach(correlation_id)
            .ok_or_else(|| HistoryError::EntryNotFound(correlation_id.to_string()))?;

        for completed in 0..requested {
            if let Err(e) = self.undo_step().await {
                return Err(HistoryError::Partial {
                    completed,
                    requested,
                    source: Box::new(e),
                });
            }
        }
        Ok(requested)
    }

    /// Empty both stacks.
    pub fn clear(&self) {
        self.lock().clear();
        tracing::debug!("History cleared");
        self.emit_status();
    }
}
