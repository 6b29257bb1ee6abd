//! # Undo/redo history
//!
//! [`HistoryEntry`] records one reversible edit as a pair of snapshots of the
//! affected cells. [`HistoryState`] holds the bounded undo and redo stacks.
//!
//! ## Stack discipline
//!
//! ```text
//! push(new edit)   undo ──► [e1 e2 e3]   redo ──► []        (redo cleared)
//! undo             undo ──► [e1 e2]      redo ──► [e3]
//! redo             undo ──► [e1 e2 e3]   redo ──► []
//! overflow         oldest undo entry evicted first
//! ```

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cell::Cell;
use crate::diff::{diff_cells, replay_diff};
use crate::operation::{CellOperation, GraphOperation};

/// Default capacity of each history stack.
pub const DEFAULT_MAX_STACK_SIZE: usize = 50;

/// Get the current Unix timestamp in milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Millisecond timestamps fit in u64
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The user-level action an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperationType {
    /// A node was created.
    AddNode,
    /// An edge was created.
    AddEdge,
    /// Attributes (label, style, metadata) changed.
    Update,
    /// Cells were moved.
    Move,
    /// Cells were resized.
    Resize,
    /// Cells were deleted.
    Delete,
    /// Several changes applied as one unit.
    Batch,
    /// Anything else.
    Other,
}

/// One reversible edit.
///
/// `cells` is the post-edit state of the affected cells and `previous_cells`
/// the pre-edit state. Cells created by the edit are absent from
/// `previous_cells`; cells deleted by it are absent from `cells`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Unique entry ID.
    pub id: String,
    /// Creation time (ms since epoch).
    pub timestamp: u64,
    /// What kind of edit this was.
    pub operation_type: HistoryOperationType,
    /// Human-readable description for menus and logs.
    pub description: String,
    /// Post-edit snapshot of affected cells.
    pub cells: Vec<Cell>,
    /// Pre-edit snapshot of affected cells.
    pub previous_cells: Vec<Cell>,
    /// Server operation this edit is reconciled against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl HistoryEntry {
    /// Create an entry with a fresh ID and the current timestamp.
    #[must_use]
    pub fn new(
        operation_type: HistoryOperationType,
        description: impl Into<String>,
        cells: Vec<Cell>,
        previous_cells: Vec<Cell>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            operation_type,
            description: description.into(),
            cells,
            previous_cells,
            correlation_id: None,
        }
    }

    /// Replace the generated ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Tag the entry with a correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Cell operations that apply this edit (`previous_cells` → `cells`).
    #[must_use]
    pub fn forward_operations(&self) -> Vec<CellOperation> {
        diff_cells(&self.previous_cells, &self.cells)
    }

    /// Cell operations that revert this edit (`cells` → `previous_cells`).
    #[must_use]
    pub fn inverse_operations(&self) -> Vec<CellOperation> {
        diff_cells(&self.cells, &self.previous_cells)
    }

    /// Executor operations for redo. Cells are restored exactly as recorded.
    #[must_use]
    pub fn redo_graph_operations(&self) -> Vec<GraphOperation> {
        GraphOperation::from_cell_operations(&replay_diff(&self.previous_cells, &self.cells))
    }

    /// Executor operations for undo. Cells are restored exactly as recorded.
    #[must_use]
    pub fn undo_graph_operations(&self) -> Vec<GraphOperation> {
        GraphOperation::from_cell_operations(&replay_diff(&self.cells, &self.previous_cells))
    }
}

/// Observable summary of the stacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatus {
    /// Whether an undo is possible.
    pub can_undo: bool,
    /// Whether a redo is possible.
    pub can_redo: bool,
    /// Entries on the undo stack.
    pub undo_stack_size: usize,
    /// Entries on the redo stack.
    pub redo_stack_size: usize,
}

/// Bounded undo and redo stacks.
#[derive(Debug, Clone)]
pub struct HistoryState {
    /// Bottom (oldest) at the front, top at the back.
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    max_stack_size: usize,
}

impl Default for HistoryState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STACK_SIZE)
    }
}

impl HistoryState {
    /// Create empty stacks holding at most `max_stack_size` entries each.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(max_stack_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_stack_size: max_stack_size.max(1),
        }
    }

    /// Configured stack capacity.
    #[must_use]
    pub const fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    /// Record a new edit. Clears the redo stack and returns the evicted
    /// oldest entry if the undo stack overflowed.
    pub fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        self.redo_stack.clear();
        self.push_undo_keep_redo(entry)
    }

    /// Put an entry on top of the undo stack without touching the redo stack.
    ///
    /// Used after a successful redo and to restore an entry whose undo failed.
    pub fn push_undo_keep_redo(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        self.undo_stack.push_back(entry);
        if self.undo_stack.len() > self.max_stack_size {
            self.undo_stack.pop_front()
        } else {
            None
        }
    }

    /// Put an entry on top of the redo stack.
    pub fn push_redo(&mut self, entry: HistoryEntry) {
        self.redo_stack.push(entry);
        if self.redo_stack.len() > self.max_stack_size {
            self.redo_stack.remove(0);
        }
    }

    /// Pop the most recent undoable entry.
    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.undo_stack.pop_back()
    }

    /// Pop the most recent redoable entry.
    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        self.redo_stack.pop()
    }

    /// Peek at the entry the next undo would revert.
    #[must_use]
    pub fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.undo_stack.back()
    }

    /// Peek at the entry the next redo would re-apply.
    #[must_use]
    pub fn peek_redo(&self) -> Option<&HistoryEntry> {
        self.redo_stack.last()
    }

    /// How many undos reach and include the entry tagged `correlation_id`.
    ///
    /// Scans from the top of the undo stack; returns `None` if no entry has
    /// that tag.
    #[must_use]
    pub fn undos_to_reach(&self, correlation_id: &str) -> Option<usize> {
        self.undo_stack
            .iter()
            .rev()
            .position(|entry| entry.correlation_id.as_deref() == Some(correlation_id))
            .map(|depth| depth + 1)
    }

    /// Index of the current position (number of undoable entries).
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of entries on the undo stack.
    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of entries on the redo stack.
    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    /// Whether an undo is possible.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Whether a redo is possible.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Summary for observers.
    #[must_use]
    pub fn status(&self) -> HistoryStatus {
        HistoryStatus {
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            undo_stack_size: self.undo_len(),
            redo_stack_size: self.redo_len(),
        }
    }

    /// Empty both stacks.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}
