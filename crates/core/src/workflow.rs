//! In-memory node-graph template.
//!
//! A workflow is a JSON object mapping node addresses to
//! `{"class_type": ..., "inputs": {...}}` records. The engine consumes
//! it verbatim, so any keys we do not model (e.g. `_meta`) are carried
//! through untouched.
//!
//! Jobs never mutate a canonical template in place: [`crate::binder::bind`]
//! clones the graph and returns the mutated copy.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::NodeId;

/// A single node of the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Engine node type, e.g. `KSampler` or `LoadImage`.
    #[serde(rename = "class_type", default)]
    pub kind: String,
    /// Named input fields.
    #[serde(rename = "inputs", default)]
    pub fields: Map<String, Value>,
    /// Any other keys present in the template.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Builder-style helper used when auto-creating nodes and in tests.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Mapping from node address to node record. Addresses are unique by
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<NodeId, Node>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a graph from an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serialize the graph into the JSON shape the engine expects.
    pub fn to_value(&self) -> Value {
        // A map of plain structs with string keys always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Load a template from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::Template {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| CoreError::Template {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write the graph to disk as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let template_err = |message: String| CoreError::Template {
            path: path.to_path_buf(),
            message,
        };
        let text = serde_json::to_string_pretty(self).map_err(|e| template_err(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| template_err(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node(&self, node: &str) -> Option<&Node> {
        self.nodes.get(node)
    }

    pub fn node_mut(&mut self, node: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node)
    }

    /// Insert (or replace) a node at the given address.
    pub fn insert_node(&mut self, id: impl Into<NodeId>, node: Node) -> Option<Node> {
        self.nodes.insert(id.into(), node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut Node)> {
        self.nodes.iter_mut()
    }

    /// Read a field; `None` when either the node or the field is absent.
    pub fn field(&self, node: &str, field: &str) -> Option<&Value> {
        self.nodes.get(node).and_then(|n| n.fields.get(field))
    }

    /// Write a field on an existing node.
    ///
    /// Returns `false` (and leaves the graph untouched) when the node
    /// does not exist.
    pub fn set_field(&mut self, node: &str, field: &str, value: Value) -> bool {
        match self.nodes.get_mut(node) {
            Some(n) => {
                n.fields.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }
}
