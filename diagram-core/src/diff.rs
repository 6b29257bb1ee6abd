//! # Cell diffing
//!
//! Computes the minimal [`CellOperation`] set between two snapshots of keyed
//! cells, and coalesces operation streams from several edits into one batch.
//!
//! ## Classification
//!
//! After normalization every cell ID falls into exactly one bucket:
//!
//! ```text
//! pre  post   result
//! --   --     -----------------------------------------------
//!  ✗    ✓     added
//!  ✓    ✗     removed
//!  ✓    ✓     updated   (canonical bytes differ)
//!  ✓    ✓     unchanged (canonical bytes equal, no operation)
//! ```
//!
//! A cell whose shape changed between snapshots (a node became an edge, or
//! the shape name differs) is never updated in place; it becomes a remove
//! followed by an add for the same ID.

use std::collections::HashMap;

use crate::cell::{Cell, CellKind};
use crate::operation::{CellOperation, CellOperationKind};

/// Counts of each operation kind in a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Number of added cells.
    pub added: usize,
    /// Number of updated cells.
    pub updated: usize,
    /// Number of removed cells.
    pub removed: usize,
}

impl DiffSummary {
    /// Count operations by kind.
    #[must_use]
    pub fn from_operations(operations: &[CellOperation]) -> Self {
        let mut summary = Self::default();
        for op in operations {
            match op.operation {
                CellOperationKind::Add => summary.added += 1,
                CellOperationKind::Update => summary.updated += 1,
                CellOperationKind::Remove => summary.removed += 1,
            }
        }
        summary
    }

    /// True when the diff produced no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Index a snapshot by ID, keeping first-seen order. Later duplicates win.
fn index(cells: &[Cell]) -> (Vec<&str>, HashMap<&str, &Cell>) {
    let mut order = Vec::with_capacity(cells.len());
    let mut by_id = HashMap::with_capacity(cells.len());
    for cell in cells {
        if by_id.insert(cell.id.as_str(), cell).is_none() {
            order.push(cell.id.as_str());
        } else {
            tracing::debug!(cell_id = %cell.id, "Duplicate cell ID in snapshot, keeping last");
        }
    }
    (order, by_id)
}

fn shape_changed(before: &Cell, after: &Cell) -> bool {
    before.shape != after.shape || before.kind() != after.kind()
}

/// How add/update payloads are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    /// Transient keys stripped; unchanged means equal canonical bytes.
    Normalized,
    /// Cells as given; unchanged means structurally equal.
    Exact,
}

impl Payload {
    fn changed(self, before: &Cell, after: &Cell) -> bool {
        match self {
            Self::Normalized => before.canonical_json() != after.canonical_json(),
            Self::Exact => before != after,
        }
    }

    fn cell(self, cell: &Cell) -> Cell {
        match self {
            Self::Normalized => cell.normalized(),
            Self::Exact => cell.clone(),
        }
    }
}

/// Compute the operations that turn `previous` into `current`.
///
/// Output order: removals first (edges before nodes, so no dangling edge is
/// ever observed), then additions and updates (nodes before edges, so edge
/// endpoints exist when edges are created). Add/update payloads are the
/// normalized cells.
#[must_use]
pub fn diff_cells(previous: &[Cell], current: &[Cell]) -> Vec<CellOperation> {
    diff_with(previous, current, Payload::Normalized)
}

/// Like [`diff_cells`], but for replaying history against a live graph.
///
/// Payloads are the cells exactly as recorded, transient attributes
/// included, and any structural difference counts as an update.
#[must_use]
pub fn replay_diff(previous: &[Cell], current: &[Cell]) -> Vec<CellOperation> {
    diff_with(previous, current, Payload::Exact)
}

fn diff_with(previous: &[Cell], current: &[Cell], payload: Payload) -> Vec<CellOperation> {
    let (prev_order, prev) = index(previous);
    let (cur_order, cur) = index(current);

    let mut edge_removals = Vec::new();
    let mut node_removals = Vec::new();
    for id in prev_order {
        let before = prev[id];
        let gone = match cur.get(id) {
            None => true,
            Some(after) => shape_changed(before, after),
        };
        if gone {
            let op = CellOperation::remove(id);
            match before.kind() {
                CellKind::Edge => edge_removals.push(op),
                CellKind::Node => node_removals.push(op),
            }
        }
    }

    let mut node_changes = Vec::new();
    let mut edge_changes = Vec::new();
    for id in cur_order {
        let after = cur[id];
        let op = match prev.get(id) {
            None => CellOperation::add(payload.cell(after)),
            Some(before) if shape_changed(before, after) => CellOperation::add(payload.cell(after)),
            Some(before) if payload.changed(before, after) => {
                CellOperation::update(payload.cell(after))
            }
            Some(_) => continue,
        };
        match after.kind() {
            CellKind::Node => node_changes.push(op),
            CellKind::Edge => edge_changes.push(op),
        }
    }

    let mut operations = edge_removals;
    operations.extend(node_removals);
    operations.extend(node_changes);
    operations.extend(edge_changes);
    operations
}

/// Net effect of several operations on one cell inside a batch window.
#[derive(Debug, Clone, PartialEq)]
enum PendingChange {
    Added(Cell),
    Updated(Cell),
    Removed,
    /// Removed and re-created; never collapsed into an in-place update.
    Replaced(Cell),
}

/// Buffer that coalesces operations from successive edits.
///
/// Operations on the same cell collapse to their net effect:
///
/// | first  | then   | result          |
/// |--------|--------|-----------------|
/// | add    | update | add (new data)  |
/// | add    | remove | nothing         |
/// | update | update | update          |
/// | update | remove | remove          |
/// | remove | add    | remove + add    |
#[derive(Debug, Clone, Default)]
pub struct OperationBatch {
    order: Vec<String>,
    changes: HashMap<String, PendingChange>,
}

impl OperationBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one operation into the batch.
    pub fn push(&mut self, op: CellOperation) {
        let CellOperation { id, operation, data } = op;
        let previous = self.changes.remove(&id);
        let next = match (previous, operation, data) {
            (previous, CellOperationKind::Add | CellOperationKind::Update, None) => {
                tracing::warn!(cell_id = %id, "Ignoring {operation:?} without data");
                previous
            }
            (None, CellOperationKind::Add, Some(cell)) => Some(PendingChange::Added(cell)),
            (None, CellOperationKind::Update, Some(cell)) => Some(PendingChange::Updated(cell)),
            (
                None | Some(PendingChange::Updated(_) | PendingChange::Removed | PendingChange::Replaced(_)),
                CellOperationKind::Remove,
                _,
            ) => Some(PendingChange::Removed),
            (Some(PendingChange::Added(_)), CellOperationKind::Remove, _) => None,
            (Some(PendingChange::Added(_)), _, Some(cell)) => Some(PendingChange::Added(cell)),
            (Some(PendingChange::Updated(_)), CellOperationKind::Update, Some(cell)) => {
                Some(PendingChange::Updated(cell))
            }
            (
                Some(PendingChange::Updated(_) | PendingChange::Removed | PendingChange::Replaced(_)),
                _,
                Some(cell),
            ) => Some(PendingChange::Replaced(cell)),
        };

        match next {
            Some(change) => {
                if !self.order.contains(&id) {
                    self.order.push(id.clone());
                }
                self.changes.insert(id, change);
            }
            None => self.order.retain(|existing| *existing != id),
        }
    }

    /// Fold several operations into the batch, in order.
    pub fn extend(&mut self, ops: impl IntoIterator<Item = CellOperation>) {
        for op in ops {
            self.push(op);
        }
    }

    /// Number of cells with a pending change.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if the batch has nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Drain the batch into its minimal operation list.
    ///
    /// Removals come first, then additions and updates with nodes before
    /// edges, matching [`diff_cells`].
    pub fn take(&mut self) -> Vec<CellOperation> {
        let order = std::mem::take(&mut self.order);
        let mut changes = std::mem::take(&mut self.changes);

        let mut removals = Vec::new();
        let mut node_changes = Vec::new();
        let mut edge_changes = Vec::new();
        for id in order {
            let Some(change) = changes.remove(&id) else {
                continue;
            };
            let upsert = match change {
                PendingChange::Added(cell) => CellOperation::add(cell),
                PendingChange::Updated(cell) => CellOperation::update(cell),
                PendingChange::Removed => {
                    removals.push(CellOperation::remove(id));
                    continue;
                }
                PendingChange::Replaced(cell) => {
                    removals.push(CellOperation::remove(id));
                    CellOperation::add(cell)
                }
            };
            let is_edge = upsert.data.as_ref().is_some_and(|c| c.kind() == CellKind::Edge);
            if is_edge {
                edge_changes.push(upsert);
            } else {
                node_changes.push(upsert);
            }
        }

        removals.extend(node_changes);
        removals.extend(edge_changes);
        removals
    }

    /// Discard everything pending, returning how many cells were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.changes.len();
        self.order.clear();
        self.changes.clear();
        dropped
    }
}

/// Coalesce an operation stream into its net effect.
#[must_use]
pub fn coalesce(ops: impl IntoIterator<Item = CellOperation>) -> Vec<CellOperation> {
    let mut batch = OperationBatch::new();
    batch.extend(ops);
    batch.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labelled(id: &str, label: &str) -> Cell {
        Cell::node(id, "process").with_attribute("attrs", json!({"text": {"text": label}}))
    }

    fn ids(ops: &[CellOperation], kind: CellOperationKind) -> Vec<String> {
        let mut out: Vec<String> = ops
            .iter()
            .filter(|op| op.operation == kind)
            .map(|op| op.id.clone())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_diff_classifies_each_id_once() {
        let previous = vec![labelled("keep", "A"), labelled("edit", "A"), labelled("drop", "A")];
        let current = vec![labelled("keep", "A"), labelled("edit", "B"), labelled("new", "A")];

        let ops = diff_cells(&previous, &current);
        assert_eq!(ids(&ops, CellOperationKind::Add), vec!["new"]);
        assert_eq!(ids(&ops, CellOperationKind::Update), vec!["edit"]);
        assert_eq!(ids(&ops, CellOperationKind::Remove), vec!["drop"]);
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_diff_against_self_is_empty() {
        let snapshot = vec![labelled("n1", "A"), Cell::edge("e1", "n1", "n2")];
        assert!(diff_cells(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_diff_ignores_transient_attributes() {
        let before = vec![labelled("n1", "A")];
        let after = vec![labelled("n1", "A").with_attribute("selected", json!(true))];
        assert!(diff_cells(&before, &after).is_empty());
    }

    #[test]
    fn test_update_payload_is_normalized() {
        let before = vec![labelled("n1", "A")];
        let after = vec![labelled("n1", "B").with_attribute("tools", json!(["remove"]))];
        let ops = diff_cells(&before, &after);
        let data = ops[0].data.as_ref().expect("update data");
        assert!(data.attribute("tools").is_none());
    }

    #[test]
    fn test_shape_change_is_remove_then_add() {
        let before = vec![Cell::node("x", "process")];
        let after = vec![Cell::edge("x", "a", "b")];
        let ops = diff_cells(&before, &after);

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].operation, CellOperationKind::Remove);
        assert_eq!(ops[1].operation, CellOperationKind::Add);
        assert_eq!(ops[0].id, "x");
        assert_eq!(ops[1].id, "x");
    }

    #[test]
    fn test_ordering_edges_removed_first_nodes_added_first() {
        let before = vec![Cell::node("a", "process"), Cell::edge("e", "a", "b")];
        let after = vec![Cell::edge("e2", "c", "d"), Cell::node("c", "process")];
        let ops = diff_cells(&before, &after);
        let order: Vec<(&str, CellOperationKind)> =
            ops.iter().map(|op| (op.id.as_str(), op.operation)).collect();
        assert_eq!(
            order,
            vec![
                ("e", CellOperationKind::Remove),
                ("a", CellOperationKind::Remove),
                ("c", CellOperationKind::Add),
                ("e2", CellOperationKind::Add),
            ]
        );
    }

    #[test]
    fn test_edit_edit_delete_window_is_single_remove() {
        let original = vec![labelled("n1", "A")];
        let first = vec![labelled("n1", "B")];
        let second = vec![labelled("n1", "C")];
        let deleted: Vec<Cell> = Vec::new();

        // Window diff: earliest pre-state against latest post-state.
        let window = diff_cells(&original, &deleted);
        assert_eq!(window, vec![CellOperation::remove("n1")]);

        // Coalescing the per-event diffs gives the same answer.
        let mut batch = OperationBatch::new();
        batch.extend(diff_cells(&original, &first));
        batch.extend(diff_cells(&first, &second));
        batch.extend(diff_cells(&second, &deleted));
        assert_eq!(batch.take(), vec![CellOperation::remove("n1")]);
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let ops = coalesce(vec![
            CellOperation::add(labelled("n1", "A")),
            CellOperation::update(labelled("n1", "B")),
            CellOperation::remove("n1"),
        ]);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_add_then_update_keeps_add_with_latest_data() {
        let ops = coalesce(vec![
            CellOperation::add(labelled("n1", "A")),
            CellOperation::update(labelled("n1", "B")),
        ]);
        assert_eq!(ops, vec![CellOperation::add(labelled("n1", "B"))]);
    }

    #[test]
    fn test_remove_then_add_stays_a_pair() {
        let ops = coalesce(vec![
            CellOperation::remove("n1"),
            CellOperation::add(Cell::edge("n1", "a", "b")),
        ]);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], CellOperation::remove("n1"));
        assert_eq!(ops[1].operation, CellOperationKind::Add);
    }

    #[test]
    fn test_batch_clear_reports_dropped() {
        let mut batch = OperationBatch::new();
        batch.push(CellOperation::add(labelled("a", "A")));
        batch.push(CellOperation::remove("b"));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.clear(), 2);
        assert!(batch.is_empty());
        assert!(batch.take().is_empty());
    }

    #[test]
    fn test_summary_counts() {
        let ops = diff_cells(&[labelled("a", "A")], &[labelled("a", "B"), labelled("b", "A")]);
        let summary = DiffSummary::from_operations(&ops);
        assert_eq!(summary, DiffSummary { added: 1, updated: 1, removed: 0 });
        assert!(!summary.is_empty());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_snapshot() -> impl Strategy<Value = Vec<Cell>> {
            prop::collection::btree_map(0u8..16, (0u8..4, any::<bool>()), 0..12).prop_map(|cells| {
                cells
                    .into_iter()
                    .map(|(id, (label, is_edge))| {
                        let id = format!("c{id}");
                        let cell = if is_edge {
                            Cell::edge(id, "s", "t")
                        } else {
                            Cell::node(id, "process")
                        };
                        cell.with_attribute("label", json!(label))
                    })
                    .collect()
            })
        }

        fn apply(base: &[Cell], ops: &[CellOperation]) -> Vec<String> {
            let mut state: HashMap<String, String> = base
                .iter()
                .map(|c| (c.id.clone(), c.canonical_json()))
                .collect();
            for op in ops {
                match op.operation {
                    CellOperationKind::Remove => {
                        state.remove(&op.id);
                    }
                    _ => {
                        let cell = op.data.as_ref().expect("data");
                        state.insert(op.id.clone(), cell.canonical_json());
                    }
                }
            }
            let mut out: Vec<String> = state.into_values().collect();
            out.sort();
            out
        }

        proptest! {
            #[test]
            fn prop_diff_self_is_empty(snapshot in arb_snapshot()) {
                prop_assert!(diff_cells(&snapshot, &snapshot).is_empty());
            }

            #[test]
            fn prop_adds_and_removes_are_inverse(a in arb_snapshot(), b in arb_snapshot()) {
                let forward = diff_cells(&a, &b);
                let backward = diff_cells(&b, &a);
                prop_assert_eq!(
                    ids(&forward, CellOperationKind::Add),
                    ids(&backward, CellOperationKind::Remove)
                );
                prop_assert_eq!(
                    ids(&forward, CellOperationKind::Remove),
                    ids(&backward, CellOperationKind::Add)
                );
                prop_assert_eq!(
                    ids(&forward, CellOperationKind::Update),
                    ids(&backward, CellOperationKind::Update)
                );
            }

            #[test]
            fn prop_applying_diff_reaches_target(a in arb_snapshot(), b in arb_snapshot()) {
                let ops = diff_cells(&a, &b);
                prop_assert_eq!(apply(&a, &ops), apply(&b, &[]));
            }

            #[test]
            fn prop_coalesced_window_matches_window_diff(
                a in arb_snapshot(),
                b in arb_snapshot(),
                c in arb_snapshot(),
            ) {
                let mut batch = OperationBatch::new();
                batch.extend(diff_cells(&a, &b));
                batch.extend(diff_cells(&b, &c));
                let coalesced = batch.take();
                prop_assert_eq!(apply(&a, &coalesced), apply(&c, &[]));
            }
        }
    }
}
