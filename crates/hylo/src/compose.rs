//! Rebuilds the graph with each engine segment replaced by one engine call.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::engine::EngineArtifact;
use crate::error::CompositionError;
use crate::graph::topology::validate_graph_topology;
use crate::graph::{EngineCallSpec, Graph, Node, NodeId, Operation, ValueId};
use crate::partition::{Partition, Segment, SegmentId, SegmentKind};
use crate::propagate::ValueTypes;

#[derive(Debug, Clone)]
pub struct Composition {
    pub graph: Graph,
    pub types: ValueTypes,
    /// Engine call node created for each engine segment.
    pub engine_calls: Vec<(SegmentId, NodeId)>,
    /// Host constants dropped because every consumer was cloned into an engine.
    pub dropped: Vec<NodeId>,
}

pub fn compose(
    graph: &Graph,
    types: &ValueTypes,
    partition: &Partition,
    artifacts: &HashMap<SegmentId, EngineArtifact>,
) -> Result<Composition, CompositionError> {
    let nodes = graph
        .nodes
        .iter()
        .map(|node| (node.id, node))
        .collect::<HashMap<_, _>>();
    let mut next_node = graph.next_node_id().0;
    let mut composed = Graph {
        name: graph.name.clone(),
        inputs: graph.inputs.clone(),
        nodes: Vec::with_capacity(partition.segments.len()),
        outputs: graph.outputs.clone(),
    };
    let mut engine_calls = Vec::new();

    for segment in &partition.segments {
        match segment.kind {
            SegmentKind::Fallback => {
                for id in &segment.nodes {
                    let node = nodes.get(id).ok_or_else(|| {
                        CompositionError::new(format!("segment {} names unknown node {id}", segment.id))
                    })?;
                    composed.nodes.push((*node).clone());
                }
            }
            SegmentKind::Engine if segment.outputs.is_empty() => {
                debug!(segment = %segment.id, "skipping engine segment without live outputs");
            }
            SegmentKind::Engine => {
                let artifact = artifacts.get(&segment.id).ok_or_else(|| {
                    CompositionError::new(format!("no engine was built for segment {}", segment.id))
                })?;
                check_boundary(segment, &nodes)?;
                check_manifest(segment, artifact, types)?;
                let id = NodeId(next_node);
                next_node += 1;
                composed.nodes.push(Node {
                    id,
                    op: Operation::EngineCall(EngineCallSpec {
                        segment: segment.id.0,
                        artifact: artifact.clone(),
                    }),
                    inputs: segment.inputs.clone(),
                    outputs: segment.outputs.clone(),
                });
                engine_calls.push((segment.id, id));
            }
        }
    }

    validate_graph_topology(&composed)
        .map_err(|err| CompositionError::new(format!("composed graph is malformed: {err}")))?;
    let imported = partition
        .engine_segments()
        .flat_map(|segment| segment.imported_constants.iter().copied())
        .collect::<HashSet<_>>();
    let dropped = drop_orphaned_constants(&mut composed, &imported);

    let live = composed
        .input_values()
        .chain(composed.nodes.iter().flat_map(|node| node.outputs.iter().copied()))
        .collect::<HashSet<_>>();
    let mut types = types.clone();
    types.retain(|value| live.contains(&value));

    debug!(
        graph = %composed.name,
        nodes = composed.nodes.len(),
        engines = engine_calls.len(),
        "composed graph"
    );
    Ok(Composition {
        graph: composed,
        types,
        engine_calls,
        dropped,
    })
}

/// Removes host copies of imported constants that no longer have a consumer.
fn drop_orphaned_constants(graph: &mut Graph, imported: &HashSet<NodeId>) -> Vec<NodeId> {
    let used = graph
        .nodes
        .iter()
        .flat_map(|node| node.inputs.iter().copied())
        .chain(graph.outputs.iter().copied())
        .collect::<HashSet<ValueId>>();
    let mut dropped = Vec::new();
    graph.nodes.retain(|node| {
        let orphaned = imported.contains(&node.id)
            && node.kind().is_constant_source()
            && node.outputs.iter().all(|value| !used.contains(value));
        if orphaned {
            dropped.push(node.id);
        }
        !orphaned
    });
    if !dropped.is_empty() {
        debug!(graph = %graph.name, dropped = dropped.len(), "dropped orphaned host constants");
    }
    dropped
}

/// Boundary inputs must come from outside the segment and outputs from inside it.
fn check_boundary(segment: &Segment, nodes: &HashMap<NodeId, &Node>) -> Result<(), CompositionError> {
    let mut produced = HashSet::<ValueId>::new();
    for id in segment.nodes.iter().chain(&segment.imported_constants) {
        if let Some(node) = nodes.get(id) {
            produced.extend(node.outputs.iter().copied());
        }
    }
    if let Some(value) = segment.inputs.iter().find(|value| produced.contains(value)) {
        return Err(CompositionError::new(format!(
            "segment {} lists internal value {value} as an input",
            segment.id
        )));
    }
    if let Some(value) = segment.outputs.iter().find(|value| !produced.contains(value)) {
        return Err(CompositionError::new(format!(
            "segment {} lists foreign value {value} as an output",
            segment.id
        )));
    }
    Ok(())
}

fn check_manifest(
    segment: &Segment,
    artifact: &EngineArtifact,
    types: &ValueTypes,
) -> Result<(), CompositionError> {
    let manifest = &artifact.manifest;
    for (what, values, bindings) in [
        ("inputs", &segment.inputs, &manifest.inputs),
        ("outputs", &segment.outputs, &manifest.outputs),
    ] {
        if values.len() != bindings.len() {
            return Err(CompositionError::new(format!(
                "segment {} has {} boundary {what} but its engine declares {}",
                segment.id,
                values.len(),
                bindings.len()
            )));
        }
        for (value, binding) in values.iter().zip(bindings) {
            if types.get(*value) != Some(&binding.spec) {
                return Err(CompositionError::new(format!(
                    "engine binding '{}' of segment {} does not match the type of {value}",
                    binding.name, segment.id
                )));
            }
        }
    }
    Ok(())
}
