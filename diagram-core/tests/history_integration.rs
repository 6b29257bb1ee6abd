//! History Integration Tests
//!
//! Drives an editing session through the core types only:
//! - Recording edits as history entries
//! - Undo/redo replayed against the in-memory graph
//! - Stack bounds and redo invalidation
//! - Diff batches that match what was replayed

use diagram_core::{
    coalesce, diff_cells, Cell, CellOperationKind, GraphOperation, HistoryEntry,
    HistoryOperationType, HistoryState, InMemoryGraph,
};
use serde_json::json;

/// Create a labelled process node.
fn process(id: &str, label: &str) -> Cell {
    Cell::node(id, "process").with_attribute("label", json!(label))
}

/// Apply a user edit to the graph and record it.
fn edit(
    graph: &mut InMemoryGraph,
    history: &mut HistoryState,
    operation_type: HistoryOperationType,
    before: Vec<Cell>,
    after: Vec<Cell>,
) -> String {
    let entry = HistoryEntry::new(operation_type, "edit", after, before);
    graph
        .apply(&entry.redo_graph_operations())
        .expect("edit applies");
    let id = entry.id.clone();
    history.push(entry);
    id
}

fn undo(graph: &mut InMemoryGraph, history: &mut HistoryState) -> HistoryEntry {
    let entry = history.pop_undo().expect("something to undo");
    graph
        .apply(&entry.undo_graph_operations())
        .expect("undo applies");
    history.push_redo(entry.clone());
    entry
}

fn redo(graph: &mut InMemoryGraph, history: &mut HistoryState) -> HistoryEntry {
    let entry = history.pop_redo().expect("something to redo");
    graph
        .apply(&entry.redo_graph_operations())
        .expect("redo applies");
    history.push_undo_keep_redo(entry.clone());
    entry
}

#[test]
fn test_undo_of_add_deletes_the_node() {
    let mut graph = InMemoryGraph::new();
    let mut history = HistoryState::new(50);

    let e1 = edit(
        &mut graph,
        &mut history,
        HistoryOperationType::AddNode,
        Vec::new(),
        vec![process("n1", "Web server")],
    );
    assert!(graph.get("n1").is_some());

    let undone = undo(&mut graph, &mut history);
    assert_eq!(undone.id, e1);
    assert_eq!(
        undone.undo_graph_operations(),
        vec![GraphOperation::DeleteCell { id: "n1".into() }]
    );
    assert!(graph.get("n1").is_none());
    assert_eq!(history.peek_redo().map(|e| e.id.as_str()), Some(e1.as_str()));
    assert!(!history.can_undo());
}

#[test]
fn test_undo_redo_round_trip_restores_graph() {
    let mut graph = InMemoryGraph::from_cells([process("n1", "start")]);
    let mut history = HistoryState::new(50);
    let original = graph.snapshot();

    edit(
        &mut graph,
        &mut history,
        HistoryOperationType::Update,
        vec![process("n1", "start")],
        vec![process("n1", "renamed")],
    );
    edit(
        &mut graph,
        &mut history,
        HistoryOperationType::AddNode,
        Vec::new(),
        vec![process("n2", "store")],
    );
    let edited = graph.snapshot();

    undo(&mut graph, &mut history);
    undo(&mut graph, &mut history);
    assert_eq!(graph.snapshot(), original);
    assert_eq!(history.redo_len(), 2);

    redo(&mut graph, &mut history);
    redo(&mut graph, &mut history);
    assert_eq!(graph.snapshot(), edited);
    assert_eq!(history.undo_len(), 2);
    assert!(!history.can_redo());
}

#[test]
fn test_undo_redo_keeps_transient_attributes() {
    let start = process("n1", "a");
    let mut graph = InMemoryGraph::from_cells([start.clone()]);
    let mut history = HistoryState::new(50);

    let renamed = process("n1", "b").with_attribute("tools", json!([{"name": "button-remove"}]));
    edit(
        &mut graph,
        &mut history,
        HistoryOperationType::Update,
        vec![start.clone()],
        vec![renamed.clone()],
    );
    assert_eq!(graph.get("n1"), Some(&renamed));

    undo(&mut graph, &mut history);
    assert_eq!(graph.get("n1"), Some(&start));
    redo(&mut graph, &mut history);
    assert_eq!(graph.get("n1"), Some(&renamed));
}

#[test]
fn test_new_edit_invalidates_redo() {
    let mut graph = InMemoryGraph::new();
    let mut history = HistoryState::new(50);

    edit(
        &mut graph,
        &mut history,
        HistoryOperationType::AddNode,
        Vec::new(),
        vec![process("n1", "a")],
    );
    undo(&mut graph, &mut history);
    assert!(history.can_redo());

    edit(
        &mut graph,
        &mut history,
        HistoryOperationType::AddNode,
        Vec::new(),
        vec![process("n2", "b")],
    );
    assert!(!history.can_redo());
    assert_eq!(history.status().undo_stack_size, 1);
}

#[test]
fn test_bounded_stack_evicts_oldest() {
    let mut graph = InMemoryGraph::new();
    let mut history = HistoryState::new(3);

    let first = edit(
        &mut graph,
        &mut history,
        HistoryOperationType::AddNode,
        Vec::new(),
        vec![process("n0", "0")],
    );
    for i in 1..5 {
        edit(
            &mut graph,
            &mut history,
            HistoryOperationType::AddNode,
            Vec::new(),
            vec![process(&format!("n{i}"), &i.to_string())],
        );
    }
    assert_eq!(history.undo_len(), 3);
    for _ in 0..3 {
        assert_ne!(undo(&mut graph, &mut history).id, first);
    }
    assert!(!history.can_undo());
    // The two evicted edits stay applied.
    assert_eq!(graph.len(), 2);
}

#[test]
fn test_session_diff_coalesces_to_net_change() {
    let start = vec![process("n1", "start"), process("n2", "keep")];
    let renamed = vec![process("n1", "A"), process("n2", "keep")];
    let added = vec![
        process("n1", "A"),
        process("n2", "keep"),
        process("n3", "new"),
    ];
    let deleted = vec![process("n2", "keep"), process("n3", "new")];

    let ops = coalesce(
        diff_cells(&start, &renamed)
            .into_iter()
            .chain(diff_cells(&renamed, &added))
            .chain(diff_cells(&added, &deleted)),
    );
    let kinds: Vec<(String, CellOperationKind)> =
        ops.iter().map(|op| (op.id.clone(), op.operation)).collect();
    assert_eq!(
        kinds,
        vec![
            ("n1".to_string(), CellOperationKind::Remove),
            ("n3".to_string(), CellOperationKind::Add),
        ]
    );

    let mut graph = InMemoryGraph::from_cells(start);
    graph
        .apply(&GraphOperation::from_cell_operations(&ops))
        .expect("apply");
    assert_eq!(graph.snapshot(), deleted);
}
