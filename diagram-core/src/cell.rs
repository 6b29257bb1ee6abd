//! Diagram cells - the nodes and edges that make up a diagram.
//!
//! A cell is an opaque bag of attributes owned by the rendering library. This
//! crate only cares about three things: its `id`, whether it is a node or an
//! edge, and which attributes are meaningful for persistence.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shape name the graph library uses for plain edges.
pub const EDGE_SHAPE: &str = "edge";

/// Top-level attributes that only exist while a cell is being interacted with.
const TRANSIENT_KEYS: &[&str] = &["tools", "selected", "highlighted", "hovered", "animation"];

/// Per-selector visual effect attribute stripped from `attrs.<selector>`.
const VISUAL_EFFECT_KEY: &str = "filter";

/// Whether a cell is a node or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    /// A vertex (process, store, actor, boundary...).
    Node,
    /// A connector between two nodes.
    Edge,
}

/// A diagram cell addressed by its ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Unique identifier within the diagram.
    pub id: String,
    /// Shape name as understood by the graph library.
    pub shape: String,
    /// Every other attribute (position, size, attrs, source, target...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Cell {
    /// Create a node with the given shape and no attributes.
    #[must_use]
    pub fn node(id: impl Into<String>, shape: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shape: shape.into(),
            attributes: Map::new(),
        }
    }

    /// Create an edge between two cells.
    #[must_use]
    pub fn edge(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        let source: String = source.into();
        let target: String = target.into();
        Self::node(id, EDGE_SHAPE)
            .with_attribute("source", serde_json::json!({ "cell": source }))
            .with_attribute("target", serde_json::json!({ "cell": target }))
    }

    /// Set an attribute, replacing any previous value.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Look up an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Whether this cell is a node or an edge.
    #[must_use]
    pub fn kind(&self) -> CellKind {
        if self.shape == EDGE_SHAPE
            || self.attributes.contains_key("source")
            || self.attributes.contains_key("target")
        {
            CellKind::Edge
        } else {
            CellKind::Node
        }
    }

    /// Copy of this cell without transient, visual-only attributes.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut cell = self.clone();
        for key in TRANSIENT_KEYS {
            cell.attributes.remove(*key);
        }
        if let Some(Value::Object(attrs)) = cell.attributes.get_mut("attrs") {
            for selector in attrs.values_mut() {
                if let Value::Object(styles) = selector {
                    styles.remove(VISUAL_EFFECT_KEY);
                }
            }
        }
        cell
    }

    /// Canonical serialization of the normalized cell.
    ///
    /// `serde_json::Map` keeps keys sorted, so two cells with identical
    /// content always produce identical bytes however they were parsed.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.normalized()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_kind() {
        let cell = Cell::node("n1", "process");
        assert_eq!(cell.kind(), CellKind::Node);
    }

    #[test]
    fn test_edge_kind_from_shape_and_endpoints() {
        assert_eq!(Cell::edge("e1", "a", "b").kind(), CellKind::Edge);

        let custom = Cell::node("e2", "flow").with_attribute("source", json!({"cell": "a"}));
        assert_eq!(custom.kind(), CellKind::Edge);
    }

    #[test]
    fn test_flattened_wire_shape() {
        let cell = Cell::node("n1", "process").with_attribute("position", json!({"x": 1, "y": 2}));
        let value = serde_json::to_value(&cell).expect("serialize");
        assert_eq!(value["id"], "n1");
        assert_eq!(value["shape"], "process");
        assert_eq!(value["position"]["x"], 1);

        let parsed: Cell = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, cell);
    }

    #[test]
    fn test_normalized_strips_transient_attributes() {
        let cell = Cell::node("n1", "process")
            .with_attribute("selected", json!(true))
            .with_attribute("tools", json!([{"name": "button-remove"}]))
            .with_attribute(
                "attrs",
                json!({"body": {"stroke": "#000", "filter": {"name": "highlight"}}}),
            );

        let normalized = cell.normalized();
        assert!(normalized.attribute("selected").is_none());
        assert!(normalized.attribute("tools").is_none());
        assert_eq!(normalized.attributes["attrs"], json!({"body": {"stroke": "#000"}}));
    }

    #[test]
    fn test_canonical_json_ignores_key_order() {
        let a: Cell = serde_json::from_str(r#"{"id":"n1","shape":"process","b":1,"a":{"y":2,"x":1}}"#)
            .expect("parse a");
        let b: Cell = serde_json::from_str(r#"{"shape":"process","a":{"x":1,"y":2},"id":"n1","b":1}"#)
            .expect("parse b");
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(
            a.canonical_json(),
            r#"{"id":"n1","shape":"process","a":{"x":1,"y":2},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_ignores_visual_effects() {
        let plain = Cell::node("n1", "process").with_attribute("attrs", json!({"body": {}}));
        let glowing = Cell::node("n1", "process")
            .with_attribute("attrs", json!({"body": {"filter": "drop-shadow"}}))
            .with_attribute("hovered", json!(true));
        assert_eq!(plain.canonical_json(), glowing.canonical_json());
    }
}
