//! Per-operation converters that translate graph nodes into engine layers.
//!
//! A registry is built once, then shared immutably by every compilation.

mod context;
mod converters;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::engine::NetworkError;
use crate::graph::{Graph, Node, OpKind, Operation, TensorLiteral, TensorSpec, ValueId};
use crate::propagate::ValueTypes;

pub use context::ConversionContext;

/// Bumped whenever the standard converter table changes behaviour.
pub const CONVERTER_TABLE_VERSION: u32 = 1;

/// A node attribute combination the registered converter cannot express.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct UnsupportedAttribute {
    pub kind: OpKind,
    pub detail: String,
}

impl UnsupportedAttribute {
    pub fn new(kind: OpKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error(transparent)]
    Unsupported(#[from] UnsupportedAttribute),
    #[error("network construction failed: {0}")]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Internal(String),
}

impl ConversionError {
    pub fn internal(message: impl Into<String>) -> Self {
        ConversionError::Internal(message.into())
    }
}

pub type ConversionResult<T> = Result<T, ConversionError>;

/// Values whose contents are known at compile time.
#[derive(Debug, Clone, Default)]
pub struct ConstantTable {
    literals: HashMap<ValueId, TensorLiteral>,
}

impl ConstantTable {
    pub fn from_graph(graph: &Graph) -> Self {
        let mut table = ConstantTable::default();
        for node in &graph.nodes {
            match &node.op {
                Operation::Constant(literal) => {
                    if let Some(value) = node.outputs.first() {
                        table.literals.insert(*value, literal.clone());
                    }
                }
                Operation::PlaceholderConst | Operation::Identity => {
                    let known = node
                        .inputs
                        .first()
                        .and_then(|value| table.literals.get(value))
                        .cloned();
                    if let (Some(literal), Some(value)) = (known, node.outputs.first()) {
                        table.literals.insert(*value, literal);
                    }
                }
                _ => {}
            }
        }
        table
    }

    pub fn get(&self, value: ValueId) -> Option<&TensorLiteral> {
        self.literals.get(&value)
    }
}

/// Read-only view of a node and its typed neighbourhood, used by support checks.
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    pub node: &'a Node,
    pub types: &'a ValueTypes,
    pub constants: &'a ConstantTable,
}

impl<'a> NodeView<'a> {
    pub fn input_spec(&self, index: usize) -> Option<&'a TensorSpec> {
        self.types.get(*self.node.inputs.get(index)?)
    }

    pub fn output_spec(&self, index: usize) -> Option<&'a TensorSpec> {
        self.types.get(*self.node.outputs.get(index)?)
    }

    pub fn constant_input(&self, index: usize) -> Option<&'a TensorLiteral> {
        self.constants.get(*self.node.inputs.get(index)?)
    }

    pub fn unsupported(&self, detail: impl Into<String>) -> UnsupportedAttribute {
        UnsupportedAttribute::new(self.node.kind(), detail)
    }
}

pub type CheckFn = fn(&NodeView<'_>) -> Result<(), UnsupportedAttribute>;
pub type ConvertFn = fn(&Node, &mut ConversionContext<'_>) -> ConversionResult<Vec<crate::engine::TensorRef>>;

/// One registered converter. `check` must be pure and node-local.
#[derive(Clone, Copy)]
pub struct ConverterEntry {
    pub kind: OpKind,
    /// Whether the converter accepts values with dynamic extents.
    pub dynamic_shapes: bool,
    pub check: CheckFn,
    pub convert: ConvertFn,
}

impl fmt::Debug for ConverterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterEntry")
            .field("kind", &self.kind)
            .field("dynamic_shapes", &self.dynamic_shapes)
            .finish()
    }
}

fn always_supported(_: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    Ok(())
}

impl ConverterEntry {
    pub fn new(kind: OpKind, convert: ConvertFn) -> Self {
        Self {
            kind,
            dynamic_shapes: false,
            check: always_supported,
            convert,
        }
    }

    pub fn with_check(mut self, check: CheckFn) -> Self {
        self.check = check;
        self
    }

    pub fn with_dynamic_shapes(mut self) -> Self {
        self.dynamic_shapes = true;
        self
    }
}

/// Operation kind to converter table.
#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    version: u32,
    entries: HashMap<OpKind, ConverterEntry>,
}

impl ConverterRegistry {
    pub fn empty(version: u32) -> Self {
        Self {
            version,
            entries: HashMap::new(),
        }
    }

    /// Converters for every operation the reference engine can express.
    pub fn standard() -> Self {
        let mut registry = Self::empty(CONVERTER_TABLE_VERSION);
        converters::register_all(&mut registry);
        registry
    }

    /// Adds or replaces the converter for `entry.kind`.
    pub fn register(&mut self, entry: ConverterEntry) -> Option<ConverterEntry> {
        self.entries.insert(entry.kind, entry)
    }

    pub fn unregister(&mut self, kind: OpKind) -> Option<ConverterEntry> {
        self.entries.remove(&kind)
    }

    pub fn without(mut self, kind: OpKind) -> Self {
        self.unregister(kind);
        self
    }

    pub fn get(&self, kind: OpKind) -> Option<&ConverterEntry> {
        self.entries.get(&kind)
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
