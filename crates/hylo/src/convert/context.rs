use std::collections::HashMap;

use super::{ConstantTable, ConversionError, ConversionResult, UnsupportedAttribute};
use crate::engine::{LayerKind, NetworkDefinition, PrecisionMode, TensorRef};
use crate::graph::{Node, NodeId, TensorLiteral, TensorSpec, ValueId};
use crate::propagate::ValueTypes;

/// Mutable state threaded through the converters of one segment.
pub struct ConversionContext<'a> {
    network: &'a mut NetworkDefinition,
    types: &'a ValueTypes,
    constants: &'a ConstantTable,
    bindings: HashMap<ValueId, TensorRef>,
    node: Option<NodeId>,
    precision: PrecisionMode,
    layer_seq: usize,
    diagnostics: Vec<String>,
}

impl<'a> ConversionContext<'a> {
    pub fn new(
        network: &'a mut NetworkDefinition,
        types: &'a ValueTypes,
        constants: &'a ConstantTable,
    ) -> Self {
        Self {
            network,
            types,
            constants,
            bindings: HashMap::new(),
            node: None,
            precision: PrecisionMode::Full,
            layer_seq: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Starts emitting layers on behalf of `node`.
    pub fn begin_node(&mut self, node: NodeId, precision: PrecisionMode) {
        self.node = Some(node);
        self.precision = precision;
        self.layer_seq = 0;
    }

    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn bind(&mut self, value: ValueId, tensor: TensorRef) {
        self.bindings.insert(value, tensor);
    }

    pub fn tensor(&self, value: ValueId) -> Option<TensorRef> {
        self.bindings.get(&value).copied()
    }

    pub fn value_spec(&self, value: ValueId) -> ConversionResult<&'a TensorSpec> {
        self.types
            .get(value)
            .ok_or_else(|| ConversionError::internal(format!("value {value} has no type")))
    }

    pub fn input(&self, node: &Node, index: usize) -> ConversionResult<TensorRef> {
        let value = operand(node, index)?;
        self.tensor(value).ok_or_else(|| {
            ConversionError::internal(format!(
                "operand {value} of node {} is not bound in the network",
                node.id
            ))
        })
    }

    pub fn input_spec(&self, node: &Node, index: usize) -> ConversionResult<&'a TensorSpec> {
        self.value_spec(operand(node, index)?)
    }

    pub fn output_spec(&self, node: &Node, index: usize) -> ConversionResult<&'a TensorSpec> {
        let value = node.outputs.get(index).copied().ok_or_else(|| {
            ConversionError::internal(format!("node {} has no result {index}", node.id))
        })?;
        self.value_spec(value)
    }

    /// Compile-time contents of an operand, when known.
    pub fn constant_input(&self, node: &Node, index: usize) -> Option<&'a TensorLiteral> {
        let value = node.inputs.get(index)?;
        self.constants.get(*value)
    }

    pub fn require_constant(&self, node: &Node, index: usize, what: &str) -> ConversionResult<&'a TensorLiteral> {
        self.constant_input(node, index).ok_or_else(|| {
            UnsupportedAttribute::new(node.kind(), format!("{what} must be a compile-time constant"))
                .into()
        })
    }

    pub fn add_layer(
        &mut self,
        kind: LayerKind,
        inputs: &[TensorRef],
        outputs: Vec<TensorSpec>,
    ) -> ConversionResult<Vec<TensorRef>> {
        let name = match self.node {
            Some(node) => format!("{node}.{}:{}", self.layer_seq, kind.name()),
            None => format!("layer{}:{}", self.network.layers().len(), kind.name()),
        };
        self.layer_seq += 1;
        Ok(self
            .network
            .add_layer(name, kind, inputs, outputs, self.precision)?)
    }

    pub fn add_single(
        &mut self,
        kind: LayerKind,
        inputs: &[TensorRef],
        output: TensorSpec,
    ) -> ConversionResult<TensorRef> {
        let outputs = self.add_layer(kind, inputs, vec![output])?;
        outputs
            .into_iter()
            .next()
            .ok_or_else(|| ConversionError::internal("layer produced no output"))
    }

    pub fn add_constant(&mut self, literal: TensorLiteral) -> ConversionResult<TensorRef> {
        let spec = literal.spec.clone();
        self.add_single(LayerKind::Constant { weights: literal }, &[], spec)
    }

    pub fn network(&self) -> &NetworkDefinition {
        &*self.network
    }

    /// Records a conversion decision, tagged with the node being converted.
    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self.node {
            Some(node) => self.diagnostics.push(format!("{node}: {message}")),
            None => self.diagnostics.push(message),
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<String> {
        self.diagnostics
    }
}

fn operand(node: &Node, index: usize) -> ConversionResult<ValueId> {
    node.inputs.get(index).copied().ok_or_else(|| {
        ConversionError::internal(format!("node {} has no operand {index}", node.id))
    })
}
