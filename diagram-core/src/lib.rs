//! # Diagram Core
//!
//! Synchronous domain logic for collaborative diagram editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                diagram-core                 │
//! ├─────────────────────────────────────────────┤
//! │  Cell Model      │  Diffing                 │
//! │  - Nodes/edges   │  - add/update/remove     │
//! │  - Normalization │  - Coalescing windows    │
//! ├─────────────────────────────────────────────┤
//! │  History         │  Graph                   │
//! │  - Entries       │  - Typed operations      │
//! │  - Bounded stacks│  - In-memory reference   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate performs I/O; the async collaboration layer lives in
//! `diagram-collab`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cell;
pub mod diff;
pub mod error;
pub mod graph;
pub mod history;
pub mod operation;

pub use cell::{Cell, CellKind};
pub use diff::{coalesce, diff_cells, replay_diff, DiffSummary, OperationBatch};
pub use error::{CoreError, CoreResult};
pub use graph::InMemoryGraph;
pub use history::{
    current_timestamp, HistoryEntry, HistoryOperationType, HistoryState, HistoryStatus,
    DEFAULT_MAX_STACK_SIZE,
};
pub use operation::{CellOperation, CellOperationKind, GraphOperation};

/// Diagram core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
