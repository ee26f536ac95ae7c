//! Converts engine segments into networks and builds them through the runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{
    BuildConfig, DeviceId, EngineArtifact, EngineCache, EngineCacheKey, EngineManifest,
    EngineRuntime, IoBinding, NetworkDefinition, PrecisionMode, ENGINE_ARTIFACT_VERSION,
};
use crate::config::CompileConfig;
use crate::convert::{ConstantTable, ConversionContext, ConverterRegistry};
use crate::error::EngineBuildError;
use crate::graph::{Graph, Node, NodeId, ValueId};
use crate::hashing::{digest, Fingerprint};
use crate::partition::{Segment, SegmentId};
use crate::propagate::ValueTypes;

/// One mutex per device, taken around runtime builds that may not overlap.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, device: &DeviceId) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        guard.entry(device.clone()).or_default().clone()
    }
}

/// Network produced from a segment, plus the notes its converters left.
#[derive(Debug, Clone)]
pub struct ConvertedSegment {
    pub network: NetworkDefinition,
    pub diagnostics: Vec<String>,
}

/// Outcome of building one segment.
#[derive(Debug, Clone)]
pub struct SegmentBuild {
    pub segment: SegmentId,
    pub result: Result<EngineArtifact, EngineBuildError>,
    /// True when the artifact was served from the build cache.
    pub cached: bool,
}

pub struct EngineBuilder<'a> {
    graph: &'a Graph,
    types: &'a ValueTypes,
    constants: &'a ConstantTable,
    registry: &'a ConverterRegistry,
    runtime: &'a dyn EngineRuntime,
    config: &'a CompileConfig,
    cache: &'a EngineCache,
    locks: &'a DeviceLocks,
    nodes: HashMap<NodeId, &'a Node>,
}

impl<'a> EngineBuilder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: &'a Graph,
        types: &'a ValueTypes,
        constants: &'a ConstantTable,
        registry: &'a ConverterRegistry,
        runtime: &'a dyn EngineRuntime,
        config: &'a CompileConfig,
        cache: &'a EngineCache,
        locks: &'a DeviceLocks,
    ) -> Self {
        let nodes = graph.nodes.iter().map(|node| (node.id, node)).collect();
        Self {
            graph,
            types,
            constants,
            registry,
            runtime,
            config,
            cache,
            locks,
            nodes,
        }
    }

    fn build_config(&self) -> BuildConfig {
        BuildConfig {
            device: self.config.device.clone(),
            precision: self.config.precision,
            workspace_limit: self.config.workspace_limit,
        }
    }

    fn node_precision(&self, node: NodeId) -> PrecisionMode {
        self.config
            .precision_overrides
            .get(&node)
            .copied()
            .unwrap_or(self.config.precision)
    }

    /// Builds every segment, in parallel unless serial builds are requested.
    /// Results follow the order of `segments`.
    pub fn build_all(&self, segments: &[&Segment]) -> Vec<SegmentBuild> {
        if self.config.serial_builds() {
            segments.iter().map(|segment| self.build_segment(segment)).collect()
        } else {
            segments
                .par_iter()
                .map(|segment| self.build_segment(segment))
                .collect()
        }
    }

    pub fn build_segment(&self, segment: &Segment) -> SegmentBuild {
        let build_config = self.build_config();
        let key = EngineCacheKey {
            segment_fingerprint: self.fingerprint(segment),
            config_digest: digest(&build_config),
            runtime: self.runtime.name().to_string(),
            version_tag: self.runtime.version_tag().to_string(),
        };
        let fingerprint = key.segment_fingerprint;

        let (result, cached) = self.cache.get_or_build(key, || {
            let ConvertedSegment {
                network,
                diagnostics,
            } = self.convert_segment(segment)?;
            let blob = {
                let lock = (!self.runtime.supports_concurrent_builds())
                    .then(|| self.locks.lock_for(&build_config.device));
                let _guard = lock
                    .as_ref()
                    .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
                self.runtime
                    .build(&network, &build_config)
                    .map_err(|err| with_diagnostics(err.to_string(), &diagnostics))?
            };
            let mut manifest = self.manifest(segment, &network, fingerprint)?;
            manifest.diagnostics = diagnostics;
            Ok(EngineArtifact::new(manifest, blob))
        });

        match &result {
            Ok(artifact) => debug!(
                segment = %segment.id,
                cached,
                layers = artifact.manifest.layer_count,
                bytes = artifact.blob_len(),
                "engine ready"
            ),
            Err(message) => warn!(segment = %segment.id, %message, "engine build failed"),
        }

        SegmentBuild {
            segment: segment.id,
            result: result.map_err(|message| EngineBuildError {
                segment: segment.id,
                nodes: segment.nodes.clone(),
                message,
            }),
            cached,
        }
    }

    /// Translates a segment into a network definition without building it.
    pub fn convert_segment(&self, segment: &Segment) -> Result<ConvertedSegment, String> {
        let mut network = NetworkDefinition::new();
        let mut bound = Vec::with_capacity(segment.inputs.len());
        for (index, value) in segment.inputs.iter().enumerate() {
            let spec = self.spec_of(*value)?;
            bound.push((*value, network.add_input(format!("input_{index}"), spec.clone())));
        }

        let (outputs, diagnostics) = {
            let mut cx = ConversionContext::new(&mut network, self.types, self.constants);
            for (value, tensor) in bound {
                cx.bind(value, tensor);
            }
            for id in segment.imported_constants.iter().chain(&segment.nodes) {
                let node = self
                    .nodes
                    .get(id)
                    .ok_or_else(|| format!("segment {} names unknown node {id}", segment.id))?;
                let entry = self
                    .registry
                    .get(node.kind())
                    .ok_or_else(|| format!("no converter registered for {}", node.kind()))?;
                cx.begin_node(node.id, self.node_precision(node.id));
                let tensors = (entry.convert)(node, &mut cx).map_err(|err| {
                    with_diagnostics(format!("converting node {}: {err}", node.id), cx.diagnostics())
                })?;
                if tensors.len() != node.outputs.len() {
                    return Err(format!(
                        "converter for {} produced {} tensors for {} results",
                        node.kind(),
                        tensors.len(),
                        node.outputs.len()
                    ));
                }
                for (value, tensor) in node.outputs.iter().zip(tensors) {
                    cx.bind(*value, tensor);
                }
            }
            let outputs = segment
                .outputs
                .iter()
                .map(|value| {
                    cx.tensor(*value)
                        .ok_or_else(|| format!("boundary output {value} was never produced"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            (outputs, cx.into_diagnostics())
        };

        for (index, tensor) in outputs.into_iter().enumerate() {
            network
                .mark_output(format!("output_{index}"), tensor)
                .map_err(|err| err.to_string())?;
        }
        network.validate().map_err(|err| err.to_string())?;
        info!(
            segment = %segment.id,
            nodes = segment.nodes.len(),
            layers = network.layers().len(),
            notes = diagnostics.len(),
            "converted segment"
        );
        Ok(ConvertedSegment {
            network,
            diagnostics,
        })
    }

    fn spec_of(&self, value: ValueId) -> Result<&'a crate::graph::TensorSpec, String> {
        self.types
            .get(value)
            .ok_or_else(|| format!("value {value} has no type"))
    }

    fn manifest(
        &self,
        segment: &Segment,
        network: &NetworkDefinition,
        fingerprint: u64,
    ) -> Result<EngineManifest, String> {
        let bindings = |values: &[ValueId], prefix: &str| {
            values
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    Ok(IoBinding {
                        name: format!("{prefix}_{index}"),
                        spec: self.spec_of(*value)?.clone(),
                    })
                })
                .collect::<Result<Vec<_>, String>>()
        };
        let built_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Ok(EngineManifest {
            artifact_version: ENGINE_ARTIFACT_VERSION,
            inputs: bindings(&segment.inputs, "input")?,
            outputs: bindings(&segment.outputs, "output")?,
            precision: self.config.precision,
            device: self.config.device.clone(),
            runtime: self.runtime.name().to_string(),
            version_tag: self.runtime.version_tag().to_string(),
            built_at_unix_ms,
            fingerprint,
            layer_count: network.layers().len(),
            diagnostics: Vec::new(),
        })
    }

    /// Stable hash of everything that determines the converted network.
    fn fingerprint(&self, segment: &Segment) -> u64 {
        let mut fingerprint = Fingerprint::new();
        fingerprint.write(&self.registry.version());
        for id in segment.imported_constants.iter().chain(&segment.nodes) {
            if let Some(node) = self.nodes.get(id) {
                fingerprint.write(*node);
                fingerprint.write(&self.node_precision(*id));
            }
        }
        for value in segment.inputs.iter().chain(&segment.outputs) {
            fingerprint.write(value);
            fingerprint.write(&self.types.get(*value));
        }
        fingerprint.write(&self.graph.name);
        fingerprint.finish()
    }
}

fn with_diagnostics(message: String, diagnostics: &[String]) -> String {
    if diagnostics.is_empty() {
        message
    } else {
        format!("{message} (conversion notes: {})", diagnostics.join("; "))
    }
}
