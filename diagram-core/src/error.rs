//! Error types for diagram operations.

use thiserror::Error;

/// Result type for diagram operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in diagram core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Cell not found in the graph.
    #[error("Cell not found: {0}")]
    CellNotFound(String),

    /// A cell with this ID already exists.
    #[error("Cell already exists: {0}")]
    DuplicateCell(String),

    /// The operation does not match the cell it targets.
    #[error("Invalid operation on cell {id}: {reason}")]
    InvalidOperation {
        /// Target cell ID.
        id: String,
        /// Why the operation was refused.
        reason: String,
    },

    /// Cell serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
