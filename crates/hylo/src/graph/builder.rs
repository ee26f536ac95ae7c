use super::{
    DType, Graph, GraphInput, Node, NodeId, Operation, Shape, TensorLiteral, TensorSpec, ValueId,
};

/// Lightweight builder for constructing traced graphs programmatically.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    next_value_id: u32,
    next_node_id: u32,
    inputs: Vec<GraphInput>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an input whose type is only known from the compile configuration.
    pub fn add_untyped_input(&mut self, name: impl Into<String>) -> ValueId {
        self.push_input(name.into(), None, None)
    }

    pub fn add_input(&mut self, name: impl Into<String>, spec: TensorSpec) -> ValueId {
        self.push_input(name.into(), Some(spec.dtype), Some(spec.shape))
    }

    fn push_input(&mut self, name: String, dtype: Option<DType>, shape: Option<Shape>) -> ValueId {
        let value = self.fresh_value();
        self.inputs.push(GraphInput {
            value,
            name,
            dtype,
            shape,
        });
        value
    }

    /// Appends a node producing `op.result_count()` values.
    pub fn emit(&mut self, op: Operation, inputs: Vec<ValueId>) -> Vec<ValueId> {
        let outputs = (0..op.result_count())
            .map(|_| self.fresh_value())
            .collect::<Vec<_>>();
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.push(Node {
            id,
            op,
            inputs,
            outputs: outputs.clone(),
        });
        outputs
    }

    /// Appends a single-result node and returns its value.
    pub fn emit_single(&mut self, op: Operation, inputs: Vec<ValueId>) -> ValueId {
        let id = NodeId(self.next_node_id);
        let value = self.fresh_value();
        self.next_node_id += 1;
        self.nodes.push(Node {
            id,
            op,
            inputs,
            outputs: vec![value],
        });
        value
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> ValueId {
        self.emit_single(Operation::Constant(literal), Vec::new())
    }

    /// Id the next emitted node will receive.
    pub fn peek_node_id(&self) -> NodeId {
        NodeId(self.next_node_id)
    }

    pub fn finish(self, name: impl Into<String>, outputs: Vec<ValueId>) -> Graph {
        Graph {
            name: name.into(),
            inputs: self.inputs,
            nodes: self.nodes,
            outputs,
        }
    }

    fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}
