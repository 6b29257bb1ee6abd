//! Operations on diagram cells.
//!
//! [`CellOperation`] is the persistence/wire form produced by diffing.
//! [`GraphOperation`] is the typed form handed to an operation executor.

use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellKind};

/// What a [`CellOperation`] does to its cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellOperationKind {
    /// The cell did not exist before.
    Add,
    /// The cell exists and its persisted attributes changed.
    Update,
    /// The cell no longer exists.
    Remove,
}

/// A single add/update/remove of one cell.
///
/// Wire shape: `{"id": "...", "operation": "add", "data": {...}}`; `data` is
/// omitted for removals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOperation {
    /// Target cell ID.
    pub id: String,
    /// Kind of change.
    pub operation: CellOperationKind,
    /// Full cell state for add/update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Cell>,
}

impl CellOperation {
    pub(crate) fn add(cell: Cell) -> Self {
        Self {
            id: cell.id.clone(),
            operation: CellOperationKind::Add,
            data: Some(cell),
        }
    }

    pub(crate) fn update(cell: Cell) -> Self {
        Self {
            id: cell.id.clone(),
            operation: CellOperationKind::Update,
            data: Some(cell),
        }
    }

    pub(crate) fn remove(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: CellOperationKind::Remove,
            data: None,
        }
    }

    /// Convert to the typed executor form.
    ///
    /// Returns `None` for an add/update that carries no data, which can only
    /// happen for operations received from an untrusted peer.
    #[must_use]
    pub fn to_graph_operation(&self) -> Option<GraphOperation> {
        match (self.operation, &self.data) {
            (CellOperationKind::Remove, _) => Some(GraphOperation::DeleteCell {
                id: self.id.clone(),
            }),
            (CellOperationKind::Add, Some(cell)) => Some(match cell.kind() {
                CellKind::Node => GraphOperation::CreateNode { cell: cell.clone() },
                CellKind::Edge => GraphOperation::CreateEdge { cell: cell.clone() },
            }),
            (CellOperationKind::Update, Some(cell)) => Some(match cell.kind() {
                CellKind::Node => GraphOperation::UpdateNode { cell: cell.clone() },
                CellKind::Edge => GraphOperation::UpdateEdge { cell: cell.clone() },
            }),
            (_, None) => None,
        }
    }
}

/// A typed graph mutation understood by the operation executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GraphOperation {
    /// Create a node.
    CreateNode {
        /// Full node state.
        cell: Cell,
    },
    /// Replace a node's state.
    UpdateNode {
        /// Full node state.
        cell: Cell,
    },
    /// Create an edge.
    CreateEdge {
        /// Full edge state.
        cell: Cell,
    },
    /// Replace an edge's state.
    UpdateEdge {
        /// Full edge state.
        cell: Cell,
    },
    /// Delete a node or edge.
    DeleteCell {
        /// Cell to delete.
        id: String,
    },
}

impl GraphOperation {
    /// ID of the cell this operation targets.
    #[must_use]
    pub fn cell_id(&self) -> &str {
        match self {
            Self::CreateNode { cell }
            | Self::UpdateNode { cell }
            | Self::CreateEdge { cell }
            | Self::UpdateEdge { cell } => &cell.id,
            Self::DeleteCell { id } => id,
        }
    }

    /// Convert a list of cell operations, dropping malformed entries.
    #[must_use]
    pub fn from_cell_operations(operations: &[CellOperation]) -> Vec<Self> {
        operations
            .iter()
            .filter_map(|op| {
                let converted = op.to_graph_operation();
                if converted.is_none() {
                    tracing::warn!(cell_id = %op.id, "Dropping {:?} operation without data", op.operation);
                }
                converted
            })
            .collect()
    }
}
