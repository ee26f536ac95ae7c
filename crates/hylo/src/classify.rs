//! Decides, per node, whether it can be handed to the engine.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::convert::{ConstantTable, ConverterRegistry, NodeView};
use crate::graph::{Graph, Node, NodeId, OpKind, ValueId};
use crate::propagate::ValueTypes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackReason {
    UnregisteredKind,
    UnsupportedAttribute(String),
    UnresolvedShape { value: ValueId },
    DemotedSmallSegment,
    EngineBuildFailed(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::UnregisteredKind => f.write_str("no converter registered"),
            FallbackReason::UnsupportedAttribute(detail) => write!(f, "unsupported attribute: {detail}"),
            FallbackReason::UnresolvedShape { value } => {
                write!(f, "value {value} has no static shape")
            }
            FallbackReason::DemotedSmallSegment => f.write_str("segment below minimum size"),
            FallbackReason::EngineBuildFailed(message) => write!(f, "engine build failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Convertible,
    Fallback(FallbackReason),
    /// Excluded by configuration even though a converter exists.
    ForceFallback,
}

impl Classification {
    pub fn is_convertible(&self) -> bool {
        matches!(self, Classification::Convertible)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Convertible => f.write_str("convertible"),
            Classification::Fallback(reason) => write!(f, "fallback ({reason})"),
            Classification::ForceFallback => f.write_str("forced fallback"),
        }
    }
}

/// Classification of every node in one graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classifications {
    entries: HashMap<NodeId, Classification>,
}

impl Classifications {
    pub fn get(&self, node: NodeId) -> Option<&Classification> {
        self.entries.get(&node)
    }

    pub fn is_convertible(&self, node: NodeId) -> bool {
        self.get(node).is_some_and(Classification::is_convertible)
    }

    pub fn set(&mut self, node: NodeId, classification: Classification) {
        self.entries.insert(node, classification);
    }

    /// Downgrades `node` to fallback for `reason`. Forced fallbacks keep their label.
    pub fn demote(&mut self, node: NodeId, reason: FallbackReason) {
        if self.get(node) != Some(&Classification::ForceFallback) {
            self.set(node, Classification::Fallback(reason));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classifies one node. Only the node, its operand and result types, and the
/// constant table are consulted.
pub fn classify_node(
    node: &Node,
    types: &ValueTypes,
    constants: &ConstantTable,
    registry: &ConverterRegistry,
    forced: &BTreeSet<OpKind>,
) -> Classification {
    let kind = node.kind();
    if forced.contains(&kind) {
        return Classification::ForceFallback;
    }
    let Some(entry) = registry.get(kind) else {
        return Classification::Fallback(FallbackReason::UnregisteredKind);
    };

    for value in node.inputs.iter().chain(&node.outputs) {
        match types.get(*value) {
            Some(spec) if entry.dynamic_shapes || spec.is_static() => {}
            _ => return Classification::Fallback(FallbackReason::UnresolvedShape { value: *value }),
        }
    }

    let view = NodeView {
        node,
        types,
        constants,
    };
    match (entry.check)(&view) {
        Ok(()) => Classification::Convertible,
        Err(err) => Classification::Fallback(FallbackReason::UnsupportedAttribute(err.detail)),
    }
}

pub fn classify_graph(
    graph: &Graph,
    types: &ValueTypes,
    constants: &ConstantTable,
    registry: &ConverterRegistry,
    forced: &BTreeSet<OpKind>,
) -> Classifications {
    let mut classifications = Classifications::default();
    for node in &graph.nodes {
        let class = classify_node(node, types, constants, registry, forced);
        classifications.set(node.id, class);
    }
    classifications
}
