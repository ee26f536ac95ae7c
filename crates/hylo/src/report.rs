use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::{Classification, FallbackReason};
use crate::engine::{DeviceId, PrecisionMode};
use crate::graph::{NodeId, OpKind};
use crate::partition::{SegmentId, SegmentKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub kind: OpKind,
    pub classification: Classification,
    pub segment: Option<SegmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentReport {
    pub id: SegmentId,
    pub kind: SegmentKind,
    pub nodes: Vec<NodeId>,
    pub imported_constants: usize,
    pub inputs: usize,
    pub outputs: usize,
    /// Engine layer count; `None` for fallback segments.
    pub layers: Option<usize>,
    pub cached: bool,
    /// Node that invokes the engine in the compiled graph.
    pub engine_node: Option<NodeId>,
    /// Converter notes for engine segments.
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

/// Human and machine readable account of how a graph was compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileReport {
    pub graph: String,
    pub registry_version: u32,
    pub runtime: String,
    pub precision: PrecisionMode,
    pub device: DeviceId,
    /// Nodes removed by lowering or by dead code elimination after composition.
    pub eliminated: Vec<NodeId>,
    pub nodes: Vec<NodeReport>,
    pub segments: Vec<SegmentReport>,
    /// Partition and build rounds; more than one means segments were demoted after a failed build.
    pub build_rounds: usize,
}

impl CompileReport {
    pub fn classification(&self, node: NodeId) -> Option<&Classification> {
        self.nodes
            .iter()
            .find(|report| report.node == node)
            .map(|report| &report.classification)
    }

    pub fn fallback_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|report| !report.classification.is_convertible())
            .map(|report| report.node)
            .collect()
    }

    pub fn nodes_with_reason(&self, reason: &FallbackReason) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|report| {
                matches!(&report.classification, Classification::Fallback(r) if r == reason)
            })
            .map(|report| report.node)
            .collect()
    }

    pub fn engine_segments(&self) -> impl Iterator<Item = &SegmentReport> {
        self.segments
            .iter()
            .filter(|segment| segment.kind == SegmentKind::Engine)
    }

    pub fn engine_count(&self) -> usize {
        self.engine_segments()
            .filter(|segment| segment.engine_node.is_some())
            .count()
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for CompileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "compile report for @{} (runtime {}, {} precision, device {}, converters v{})",
            self.graph, self.runtime, self.precision, self.device, self.registry_version
        )?;
        if !self.eliminated.is_empty() {
            let ids = self
                .eliminated
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            writeln!(f, "  eliminated: {}", ids.join(", "))?;
        }
        writeln!(f, "  nodes:")?;
        for node in &self.nodes {
            let segment = node
                .segment
                .map(|segment| segment.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "    {:<6} {:<20} {:<5} {}",
                node.node.to_string(),
                node.kind.name(),
                segment,
                node.classification
            )?;
        }
        writeln!(f, "  segments:")?;
        for segment in &self.segments {
            let ids = segment
                .nodes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            match segment.kind {
                SegmentKind::Engine => writeln!(
                    f,
                    "    {} engine  [{}] in={} out={} layers={} cached={}",
                    segment.id,
                    ids.join(" "),
                    segment.inputs,
                    segment.outputs,
                    segment.layers.unwrap_or(0),
                    segment.cached
                )?,
                SegmentKind::Fallback => {
                    writeln!(f, "    {} host    [{}]", segment.id, ids.join(" "))?
                }
            }
            for note in &segment.diagnostics {
                writeln!(f, "      note: {note}")?;
            }
        }
        write!(f, "  build rounds: {}", self.build_rounds)
    }
}
