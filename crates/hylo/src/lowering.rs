//! Graph-to-graph simplification run before type propagation.
//!
//! Surviving nodes keep their ids so later diagnostics refer to the traced
//! graph; removed ids are reported.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::graph::{Graph, NodeId, Operation, ValueId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoweringOutcome {
    /// Ids of every node removed, in graph order.
    pub eliminated: Vec<NodeId>,
}

/// Runs every lowering pass in order.
pub fn lower(graph: &mut Graph) -> LoweringOutcome {
    let mut eliminated = eliminate_noops(graph);
    eliminated.extend(eliminate_dead_code(graph));
    eliminated.sort();
    debug!(graph = %graph.name, removed = eliminated.len(), "lowered graph");
    LoweringOutcome { eliminated }
}

fn is_inference_noop(op: &Operation) -> bool {
    matches!(op, Operation::Identity | Operation::Dropout(_))
}

/// Removes identity-like nodes and forwards their operand to every use.
pub fn eliminate_noops(graph: &mut Graph) -> Vec<NodeId> {
    let mut forward: HashMap<ValueId, ValueId> = HashMap::new();
    let mut removed = Vec::new();

    let resolve = |forward: &HashMap<ValueId, ValueId>, mut value: ValueId| {
        while let Some(next) = forward.get(&value) {
            value = *next;
        }
        value
    };

    for node in &mut graph.nodes {
        for input in &mut node.inputs {
            *input = resolve(&forward, *input);
        }
        if is_inference_noop(&node.op) && node.inputs.len() == 1 && node.outputs.len() == 1 {
            forward.insert(node.outputs[0], node.inputs[0]);
            removed.push(node.id);
        }
    }

    if removed.is_empty() {
        return removed;
    }
    for output in &mut graph.outputs {
        *output = resolve(&forward, *output);
    }
    let removed_set = removed.iter().copied().collect::<HashSet<_>>();
    graph.nodes.retain(|node| !removed_set.contains(&node.id));
    removed
}

/// Custom operations may have effects outside the graph and are never removed.
fn is_side_effecting(op: &Operation) -> bool {
    matches!(op, Operation::Custom(_))
}

/// Drops nodes none of whose results reach a graph output.
pub fn eliminate_dead_code(graph: &mut Graph) -> Vec<NodeId> {
    let def_map = graph
        .nodes
        .iter()
        .enumerate()
        .flat_map(|(idx, node)| node.outputs.iter().map(move |value| (*value, idx)))
        .collect::<HashMap<_, _>>();

    let mut worklist = graph.outputs.clone();
    for node in &graph.nodes {
        if is_side_effecting(&node.op) {
            worklist.extend(node.outputs.iter().copied());
            worklist.extend(node.inputs.iter().copied());
        }
    }

    let mut live_nodes = HashSet::new();
    let mut seen = HashSet::new();
    while let Some(value) = worklist.pop() {
        if !seen.insert(value) {
            continue;
        }
        let Some(&idx) = def_map.get(&value) else {
            continue;
        };
        if live_nodes.insert(idx) {
            worklist.extend(graph.nodes[idx].inputs.iter().copied());
        }
    }

    let mut removed = Vec::new();
    let mut idx = 0;
    graph.nodes.retain(|node| {
        let keep = live_nodes.contains(&idx) || is_side_effecting(&node.op);
        if !keep {
            removed.push(node.id);
        }
        idx += 1;
        keep
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DropoutSpec, GraphBuilder, TensorLiteral, UnaryOp};

    #[test]
    fn noops_are_forwarded_and_reported() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_untyped_input("x");
        let a = builder.emit_single(Operation::Identity, vec![x]);
        let b = builder.emit_single(Operation::Dropout(DropoutSpec { p: 0.5 }), vec![a]);
        let c = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![b]);
        let mut graph = builder.finish("g", vec![c]);

        let outcome = lower(&mut graph);

        assert_eq!(outcome.eliminated, vec![NodeId(0), NodeId(1)]);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].id, NodeId(2));
        assert_eq!(graph.nodes[0].inputs, vec![x]);
    }

    #[test]
    fn graph_output_through_identity_is_rewired() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_untyped_input("x");
        let y = builder.emit_single(Operation::Identity, vec![x]);
        let mut graph = builder.finish("g", vec![y]);

        lower(&mut graph);

        assert!(graph.nodes.is_empty());
        assert_eq!(graph.outputs, vec![x]);
    }

    #[test]
    fn unused_constants_are_dropped() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_untyped_input("x");
        builder.constant(TensorLiteral::scalar_f32(1.0));
        let y = builder.emit_single(Operation::Unary(UnaryOp::Neg), vec![x]);
        let mut graph = builder.finish("g", vec![y]);

        let removed = eliminate_dead_code(&mut graph);

        assert_eq!(removed, vec![NodeId(0)]);
        assert_eq!(graph.nodes.len(), 1);
    }
}
