//! In-memory graph that applies [`GraphOperation`]s to a keyed cell map.
//!
//! The real graph lives in the rendering library; this is the reference
//! implementation used to mirror remote state and to exercise undo/redo.

use std::collections::HashMap;

use crate::cell::{Cell, CellKind};
use crate::error::{CoreError, CoreResult};
use crate::operation::GraphOperation;

/// A diagram held as plain cells.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraph {
    cells: HashMap<String, Cell>,
    /// Insertion order, for stable snapshots.
    order: Vec<String>,
}

impl InMemoryGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a graph from a snapshot. Later duplicates replace earlier ones.
    #[must_use]
    pub fn from_cells(cells: impl IntoIterator<Item = Cell>) -> Self {
        let mut graph = Self::new();
        for cell in cells {
            graph.upsert(cell);
        }
        graph
    }

    fn upsert(&mut self, cell: Cell) {
        if !self.cells.contains_key(&cell.id) {
            self.order.push(cell.id.clone());
        }
        self.cells.insert(cell.id.clone(), cell);
    }

    fn apply_one(&mut self, op: &GraphOperation) -> CoreResult<()> {
        match op {
            GraphOperation::CreateNode { cell } | GraphOperation::CreateEdge { cell } => {
                if self.cells.contains_key(&cell.id) {
                    return Err(CoreError::DuplicateCell(cell.id.clone()));
                }
                self.upsert(cell.clone());
            }
            GraphOperation::UpdateNode { cell } | GraphOperation::UpdateEdge { cell } => {
                let expected = if matches!(op, GraphOperation::UpdateNode { .. }) {
                    CellKind::Node
                } else {
                    CellKind::Edge
                };
                let existing = self
                    .cells
                    .get(&cell.id)
                    .ok_or_else(|| CoreError::CellNotFound(cell.id.clone()))?;
                if existing.kind() != expected {
                    return Err(CoreError::InvalidOperation {
                        id: cell.id.clone(),
                        reason: format!("cell is a {:?}, not a {expected:?}", existing.kind()),
                    });
                }
                self.cells.insert(cell.id.clone(), cell.clone());
            }
            GraphOperation::DeleteCell { id } => {
                if self.cells.remove(id).is_none() {
                    return Err(CoreError::CellNotFound(id.clone()));
                }
                self.order.retain(|existing| existing != id);
            }
        }
        Ok(())
    }

    /// Apply operations atomically, returning the affected cell IDs.
    ///
    /// # Errors
    ///
    /// Returns the first failing operation's error; the graph is left
    /// unchanged in that case.
    pub fn apply(&mut self, operations: &[GraphOperation]) -> CoreResult<Vec<String>> {
        let mut staged = self.clone();
        let mut affected = Vec::with_capacity(operations.len());
        for op in operations {
            staged.apply_one(op)?;
            affected.push(op.cell_id().to_string());
        }
        *self = staged;
        Ok(affected)
    }

    /// Look up a cell.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Cell> {
        self.cells.get(id)
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the graph has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All cells in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Cell> {
        self.order
            .iter()
            .filter_map(|id| self.cells.get(id).cloned())
            .collect()
    }
}
