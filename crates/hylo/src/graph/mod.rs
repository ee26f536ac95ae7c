//! Traced dataflow graph: values, nodes and the operation vocabulary.

mod builder;
mod display;
mod ops;
pub mod topology;
mod types;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use builder::GraphBuilder;
pub use ops::{
    AdaptivePool2dSpec, ArgMaxSpec, AxisSpec, BatchNormSpec, BinaryOp, CastSpec, ClampSpec,
    Conv2dSpec, CumSumSpec, CustomAttr, CustomSpec, DropoutSpec, EngineCallSpec, FlattenSpec,
    LeakyReluSpec, LinearSpec, OpKind, Operation, Pool2dSpec, ReduceKind, ReduceSpec,
    ReshapeDim, ReshapeSpec, SliceSpec, SoftmaxSpec, TopKSpec, TransposeSpec, UnaryOp,
    UnknownOpKind,
};
pub use types::{DType, DimSymbol, Dimension, Shape, TensorLiteral, TensorSpec};

/// Identifies a value (an edge) in a graph. Each value has exactly one producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Stable node identity. Ids survive lowering and are what reports refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op: Operation,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

impl Node {
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

/// A graph input. Shape and dtype may be unknown in the trace; the compile
/// configuration supplies concrete specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    pub value: ValueId,
    pub name: String,
    pub dtype: Option<DType>,
    pub shape: Option<Shape>,
}

/// Nodes are stored in topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub inputs: Vec<GraphInput>,
    pub nodes: Vec<Node>,
    pub outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn input_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs.iter().map(|input| input.value)
    }

    /// Smallest value id not used by any input or node result.
    pub fn next_value_id(&self) -> ValueId {
        let max = self
            .input_values()
            .chain(self.nodes.iter().flat_map(|node| node.outputs.iter().copied()))
            .map(|value| value.0)
            .max();
        ValueId(max.map_or(0, |value| value + 1))
    }

    pub fn next_node_id(&self) -> NodeId {
        let max = self.nodes.iter().map(|node| node.id.0).max();
        NodeId(max.map_or(0, |value| value + 1))
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}
