//! Groups classified nodes into engine segments and single-node fallback segments.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::{Classification, Classifications};
use crate::error::CompositionError;
use crate::graph::topology::{validate_graph_topology, GraphIndex, Producer};
use crate::graph::{Graph, NodeId, Operation, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    Engine,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: SegmentId,
    pub kind: SegmentKind,
    /// Member nodes in graph order.
    pub nodes: Vec<NodeId>,
    /// Constant nodes outside the segment that are cloned into its engine.
    pub imported_constants: Vec<NodeId>,
    /// Boundary inputs in order of first use.
    pub inputs: Vec<ValueId>,
    /// Boundary outputs in order of production.
    pub outputs: Vec<ValueId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub segments: Vec<Segment>,
    /// Convertible nodes pushed back to the host because their run was too small.
    pub demoted: Vec<NodeId>,
}

impl Partition {
    pub fn engine_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind == SegmentKind::Engine)
    }
}

enum Draft {
    Engine(Vec<usize>),
    Fallback(usize),
}

/// Splits `graph` into maximal contiguous convertible runs and fallback nodes.
///
/// Runs with fewer than `min_segment_size` compute nodes (constants do not
/// count; the minimum is clamped to 1) are demoted to fallback.
pub fn partition(
    graph: &Graph,
    classes: &Classifications,
    min_segment_size: usize,
) -> Result<Partition, CompositionError> {
    validate_graph_topology(graph).map_err(|err| CompositionError::new(err.to_string()))?;
    let index = GraphIndex::new(graph);
    let min_segment_size = min_segment_size.max(1);

    let mut drafts = Vec::new();
    let mut run = Vec::new();
    for (position, node) in graph.nodes.iter().enumerate() {
        if classes.is_convertible(node.id) {
            run.push(position);
        } else {
            if !run.is_empty() {
                drafts.push(Draft::Engine(std::mem::take(&mut run)));
            }
            drafts.push(Draft::Fallback(position));
        }
    }
    if !run.is_empty() {
        drafts.push(Draft::Engine(run));
    }

    let mut demoted = Vec::new();
    let mut layout = Vec::with_capacity(drafts.len());
    for draft in drafts {
        match draft {
            Draft::Engine(positions) => {
                let compute = positions
                    .iter()
                    .filter(|&&position| !graph.nodes[position].kind().is_constant_source())
                    .count();
                if compute >= min_segment_size {
                    layout.push(Draft::Engine(positions));
                } else {
                    for position in positions {
                        demoted.push(graph.nodes[position].id);
                        layout.push(Draft::Fallback(position));
                    }
                }
            }
            fallback => layout.push(fallback),
        }
    }

    let mut segment_at = vec![0usize; graph.nodes.len()];
    for (segment, draft) in layout.iter().enumerate() {
        match draft {
            Draft::Engine(positions) => {
                for &position in positions {
                    segment_at[position] = segment;
                }
            }
            Draft::Fallback(position) => segment_at[*position] = segment,
        }
    }

    let imports = layout
        .iter()
        .map(|draft| match draft {
            Draft::Engine(positions) => importable_constants(graph, &index, classes, positions),
            Draft::Fallback(_) => Vec::new(),
        })
        .collect::<Vec<_>>();

    let graph_outputs = graph.outputs.iter().copied().collect::<HashSet<_>>();
    let mut segments = Vec::with_capacity(layout.len());
    for (segment, draft) in layout.iter().enumerate() {
        let (kind, positions) = match draft {
            Draft::Engine(positions) => (SegmentKind::Engine, positions.clone()),
            Draft::Fallback(position) => (SegmentKind::Fallback, vec![*position]),
        };
        let imported = &imports[segment];
        let members = positions.iter().copied().collect::<HashSet<_>>();

        let mut inputs = Vec::new();
        let mut seen = HashSet::new();
        for &position in &positions {
            for value in &graph.nodes[position].inputs {
                let internal = match index.producer(*value) {
                    Some(Producer::Node { position: producer, .. }) => {
                        members.contains(&producer) || imported.contains(&producer)
                    }
                    _ => false,
                };
                if !internal && seen.insert(*value) {
                    inputs.push(*value);
                }
            }
        }

        let mut outputs = Vec::new();
        for &position in &positions {
            let node = &graph.nodes[position];
            for value in &node.outputs {
                let escapes = graph_outputs.contains(value)
                    || index.users(*value).iter().any(|&user| {
                        !members.contains(&user) && !imports[segment_at[user]].contains(&position)
                    });
                if escapes {
                    outputs.push(*value);
                }
            }
        }

        segments.push(Segment {
            id: SegmentId(segment as u32),
            kind,
            nodes: positions.iter().map(|&p| graph.nodes[p].id).collect(),
            imported_constants: imported.iter().map(|&p| graph.nodes[p].id).collect(),
            inputs,
            outputs,
        });
    }

    check_acyclic(&segments, &index, &segment_at)?;

    debug!(
        graph = %graph.name,
        segments = segments.len(),
        engines = segments.iter().filter(|s| s.kind == SegmentKind::Engine).count(),
        demoted = demoted.len(),
        "partitioned graph"
    );
    Ok(Partition { segments, demoted })
}

/// Constant producers outside `positions` that feed it and may be cloned in.
fn importable_constants(
    graph: &Graph,
    index: &GraphIndex,
    classes: &Classifications,
    positions: &[usize],
) -> Vec<usize> {
    let members = positions.iter().copied().collect::<HashSet<_>>();
    let mut imported = Vec::new();
    for &position in positions {
        for value in &graph.nodes[position].inputs {
            let Some(Producer::Node { position: producer, .. }) = index.producer(*value) else {
                continue;
            };
            let node = &graph.nodes[producer];
            let clonable = matches!(node.op, Operation::Constant(_))
                && classes.get(node.id) != Some(&Classification::ForceFallback);
            if clonable && !members.contains(&producer) && !imported.contains(&producer) {
                imported.push(producer);
            }
        }
    }
    imported
}

/// Segments are emitted in graph order, so the segment DAG is acyclic exactly
/// when every boundary edge points forward.
fn check_acyclic(
    segments: &[Segment],
    index: &GraphIndex,
    segment_at: &[usize],
) -> Result<(), CompositionError> {
    for (consumer, segment) in segments.iter().enumerate() {
        for value in &segment.inputs {
            match index.producer(*value) {
                Some(Producer::Node { position, .. }) if segment_at[position] >= consumer => {
                    return Err(CompositionError::new(format!(
                        "segment {} consumes {value} from segment s{}, forming a cycle",
                        segment.id, segment_at[position]
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(CompositionError::new(format!(
                        "segment {} consumes undefined value {value}",
                        segment.id
                    )));
                }
            }
        }
    }
    Ok(())
}
