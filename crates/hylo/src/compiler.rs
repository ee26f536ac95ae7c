//! The compile pipeline: lowering, propagation, classification, partitioning,
//! engine builds and composition.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::classify::{classify_graph, Classification, Classifications, FallbackReason};
use crate::compose::compose;
use crate::config::{BuildFailurePolicy, CompileConfig};
use crate::convert::{ConstantTable, ConverterRegistry};
use crate::engine::builder::{DeviceLocks, EngineBuilder};
use crate::engine::{EngineArtifact, EngineCache, EngineRuntime};
use crate::error::{CompileError, CompileResult, CompositionError, ShapeInferenceError};
use crate::graph::topology::validate_graph_topology;
use crate::graph::{Graph, NodeId};
use crate::lowering::lower;
use crate::module::CompiledModule;
use crate::partition::{partition, Partition, Segment, SegmentId, SegmentKind};
use crate::propagate::propagate;
use crate::report::{CompileReport, NodeReport, SegmentReport};

/// Compiles graphs against one converter registry and one engine runtime.
///
/// The engine cache lives as long as the compiler, so recompiling an
/// unchanged segment reuses its engine.
pub struct Compiler {
    registry: Arc<ConverterRegistry>,
    runtime: Arc<dyn EngineRuntime>,
    cache: EngineCache,
    locks: DeviceLocks,
}

struct BuiltSegment {
    artifact: EngineArtifact,
    cached: bool,
}

impl Compiler {
    pub fn new(registry: Arc<ConverterRegistry>, runtime: Arc<dyn EngineRuntime>) -> Self {
        Self {
            registry,
            runtime,
            cache: EngineCache::new(),
            locks: DeviceLocks::new(),
        }
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &dyn EngineRuntime {
        self.runtime.as_ref()
    }

    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    /// Compiles `graph` into a hybrid module. Either every stage succeeds or
    /// one attributable error is returned.
    pub fn compile(&self, graph: &Graph, config: &CompileConfig) -> CompileResult<CompiledModule> {
        config.validate(graph)?;
        validate_graph_topology(graph)
            .map_err(|err| CompositionError::new(format!("input graph is malformed: {err}")))?;

        let mut graph = graph.clone();
        let mut eliminated = if config.lowering {
            lower(&mut graph).eliminated
        } else {
            Vec::new()
        };

        let types = propagate(&graph, &config.input_specs)?;
        debug!(graph = %graph.name, values = types.len(), "propagated types");

        let constants = ConstantTable::from_graph(&graph);
        let mut classes = classify_graph(
            &graph,
            &types,
            &constants,
            &self.registry,
            &config.forced_fallback(),
        );
        if config.strict_conversion {
            check_strict(&graph, &classes)?;
        }

        let builder = EngineBuilder::new(
            &graph,
            &types,
            &constants,
            &self.registry,
            self.runtime.as_ref(),
            config,
            &self.cache,
            &self.locks,
        );

        let mut build_rounds = 0;
        let (layout, built) = loop {
            build_rounds += 1;
            let current = partition(&graph, &classes, config.effective_min_segment_size())?;
            for node in &current.demoted {
                classes.demote(*node, FallbackReason::DemotedSmallSegment);
            }

            let pending = current
                .engine_segments()
                .filter(|segment| !segment.outputs.is_empty())
                .collect::<Vec<&Segment>>();
            let mut built = HashMap::new();
            let mut failures = Vec::new();
            for build in builder.build_all(&pending) {
                match build.result {
                    Ok(artifact) => {
                        built.insert(
                            build.segment,
                            BuiltSegment {
                                artifact,
                                cached: build.cached,
                            },
                        );
                    }
                    Err(err) => failures.push(err),
                }
            }
            if failures.is_empty() {
                break (current, built);
            }

            match config.build_failure_policy {
                BuildFailurePolicy::Abort => {
                    failures.sort_by_key(|err| err.segment);
                    return Err(CompileError::EngineBuild(failures.swap_remove(0)));
                }
                BuildFailurePolicy::FallbackAndContinue => {
                    for err in failures {
                        warn!(
                            segment = %err.segment,
                            nodes = err.nodes.len(),
                            message = %err.message,
                            "demoting segment after engine build failure"
                        );
                        for node in &err.nodes {
                            classes.demote(*node, FallbackReason::EngineBuildFailed(err.message.clone()));
                        }
                    }
                }
            }
        };

        let artifacts = built
            .iter()
            .map(|(segment, built)| (*segment, built.artifact.clone()))
            .collect::<HashMap<_, _>>();
        let composition = compose(&graph, &types, &layout, &artifacts)?;
        eliminated.extend(composition.dropped.iter().copied());
        eliminated.sort();

        let engine_nodes = composition
            .engine_calls
            .iter()
            .copied()
            .collect::<HashMap<SegmentId, NodeId>>();
        let report = CompileReport {
            graph: graph.name.clone(),
            registry_version: self.registry.version(),
            runtime: self.runtime.name().to_string(),
            precision: config.precision,
            device: config.device.clone(),
            eliminated,
            nodes: node_reports(&graph, &classes, &layout),
            segments: segment_reports(&layout, &built, &engine_nodes),
            build_rounds,
        };

        info!(
            graph = %report.graph,
            nodes = report.nodes.len(),
            fallback = report.fallback_nodes().len(),
            engines = report.engine_count(),
            rounds = build_rounds,
            "compiled graph"
        );
        Ok(CompiledModule::new(
            composition.graph,
            composition.types,
            config.input_specs.clone(),
            report,
        ))
    }
}

/// Compiles with a one-off [`Compiler`].
pub fn compile(
    graph: &Graph,
    config: &CompileConfig,
    registry: Arc<ConverterRegistry>,
    runtime: Arc<dyn EngineRuntime>,
) -> CompileResult<CompiledModule> {
    Compiler::new(registry, runtime).compile(graph, config)
}

/// With strict conversion every node outside a forced fallback must convert.
fn check_strict(graph: &Graph, classes: &Classifications) -> CompileResult<()> {
    for node in &graph.nodes {
        let Some(Classification::Fallback(reason)) = classes.get(node.id) else {
            continue;
        };
        return Err(match reason {
            FallbackReason::UnregisteredKind => CompileError::UnsupportedOperator {
                node: node.id,
                kind: node.kind(),
            },
            FallbackReason::UnresolvedShape { value } => {
                CompileError::ShapeInference(ShapeInferenceError {
                    node: Some(node.id),
                    value: Some(*value),
                    message: "value has no static shape and the converter requires one".to_string(),
                })
            }
            other => CompileError::UnsupportedAttribute {
                node: node.id,
                kind: node.kind(),
                detail: match other {
                    FallbackReason::UnsupportedAttribute(detail) => detail.clone(),
                    other => other.to_string(),
                },
            },
        });
    }
    Ok(())
}

fn node_reports(graph: &Graph, classes: &Classifications, partition: &Partition) -> Vec<NodeReport> {
    let mut segment_of = HashMap::new();
    for segment in &partition.segments {
        for node in &segment.nodes {
            segment_of.insert(*node, segment.id);
        }
    }
    graph
        .nodes
        .iter()
        .map(|node| NodeReport {
            node: node.id,
            kind: node.kind(),
            classification: classes
                .get(node.id)
                .cloned()
                .unwrap_or(Classification::Fallback(FallbackReason::UnregisteredKind)),
            segment: segment_of.get(&node.id).copied(),
        })
        .collect()
}

fn segment_reports(
    partition: &Partition,
    built: &HashMap<SegmentId, BuiltSegment>,
    engine_nodes: &HashMap<SegmentId, NodeId>,
) -> Vec<SegmentReport> {
    partition
        .segments
        .iter()
        .map(|segment| {
            let build = built.get(&segment.id);
            SegmentReport {
                id: segment.id,
                kind: segment.kind,
                nodes: segment.nodes.clone(),
                imported_constants: segment.imported_constants.len(),
                inputs: segment.inputs.len(),
                outputs: segment.outputs.len(),
                layers: match segment.kind {
                    SegmentKind::Engine => build.map(|b| b.artifact.manifest.layer_count),
                    SegmentKind::Fallback => None,
                },
                cached: build.is_some_and(|b| b.cached),
                engine_node: engine_nodes.get(&segment.id).copied(),
                diagnostics: build
                    .map(|b| b.artifact.manifest.diagnostics.clone())
                    .unwrap_or_default(),
            }
        })
        .collect()
}
