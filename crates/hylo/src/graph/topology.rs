use std::collections::{HashMap, HashSet};
use std::fmt;

use super::{Graph, NodeId, ValueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An operand is consumed before any node (or graph input) defines it.
    MissingValue { value: ValueId, node: NodeId },
    /// A value is defined more than once.
    DuplicateDefinition { value: ValueId, node: Option<NodeId> },
    /// A graph output is never defined.
    UndefinedOutput { value: ValueId },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::MissingValue { value, node } => {
                write!(f, "operand {value} is missing before node {node}")
            }
            TopologyError::DuplicateDefinition { value, node: Some(node) } => {
                write!(f, "value {value} is redefined by node {node}")
            }
            TopologyError::DuplicateDefinition { value, node: None } => {
                write!(f, "graph input {value} is declared more than once")
            }
            TopologyError::UndefinedOutput { value } => {
                write!(f, "graph output {value} is never defined")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Checks that every operand is defined before use and that each value has one producer.
pub fn validate_graph_topology(graph: &Graph) -> Result<(), TopologyError> {
    let mut available = HashSet::new();
    for value in graph.input_values() {
        if !available.insert(value) {
            return Err(TopologyError::DuplicateDefinition { value, node: None });
        }
    }

    for node in &graph.nodes {
        for value in &node.inputs {
            if !available.contains(value) {
                return Err(TopologyError::MissingValue {
                    value: *value,
                    node: node.id,
                });
            }
        }
        for value in &node.outputs {
            if !available.insert(*value) {
                return Err(TopologyError::DuplicateDefinition {
                    value: *value,
                    node: Some(node.id),
                });
            }
        }
    }

    for value in &graph.outputs {
        if !available.contains(value) {
            return Err(TopologyError::UndefinedOutput { value: *value });
        }
    }
    Ok(())
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    Input(usize),
    Node { position: usize, output: usize },
}

/// Producer and consumer lookup tables for one graph.
#[derive(Debug, Default)]
pub struct GraphIndex {
    producers: HashMap<ValueId, Producer>,
    users: HashMap<ValueId, Vec<usize>>,
    positions: HashMap<NodeId, usize>,
}

impl GraphIndex {
    pub fn new(graph: &Graph) -> Self {
        let mut index = GraphIndex::default();
        for (position, input) in graph.inputs.iter().enumerate() {
            index.producers.insert(input.value, Producer::Input(position));
        }
        for (position, node) in graph.nodes.iter().enumerate() {
            index.positions.insert(node.id, position);
            for (output, value) in node.outputs.iter().enumerate() {
                index
                    .producers
                    .insert(*value, Producer::Node { position, output });
            }
            for value in &node.inputs {
                let users = index.users.entry(*value).or_default();
                if users.last() != Some(&position) {
                    users.push(position);
                }
            }
        }
        index
    }

    pub fn producer(&self, value: ValueId) -> Option<Producer> {
        self.producers.get(&value).copied()
    }

    /// Positions of nodes consuming `value`, in graph order, without duplicates.
    pub fn users(&self, value: ValueId) -> &[usize] {
        self.users.get(&value).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.positions.get(&node).copied()
    }
}
