use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::engine::{DeviceId, PrecisionMode};
use crate::env;
use crate::error::CompileError;
use crate::graph::{Graph, NodeId, OpKind, TensorSpec};
use crate::hashing::digest;

pub const DEFAULT_WORKSPACE_LIMIT: u64 = 1 << 30;
pub const DEFAULT_MIN_SEGMENT_SIZE: usize = 3;

/// What to do when the engine runtime rejects a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildFailurePolicy {
    /// Fail the whole compilation with the first build error.
    Abort,
    /// Demote the failed segment's nodes to fallback and re-partition.
    FallbackAndContinue,
}

/// Options for one compilation. Input specs and the build failure policy have
/// no defaults and must be supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileConfig {
    pub input_specs: Vec<TensorSpec>,
    pub build_failure_policy: BuildFailurePolicy,
    pub precision: PrecisionMode,
    pub device: DeviceId,
    pub workspace_limit: u64,
    pub force_fallback_ops: BTreeSet<OpKind>,
    pub min_segment_size: usize,
    pub precision_overrides: BTreeMap<NodeId, PrecisionMode>,
    /// Turns every convertibility failure into a compile error.
    pub strict_conversion: bool,
    pub lowering: bool,
    pub serial_builds: bool,
}

impl CompileConfig {
    pub fn new(input_specs: Vec<TensorSpec>, build_failure_policy: BuildFailurePolicy) -> Self {
        Self {
            input_specs,
            build_failure_policy,
            precision: PrecisionMode::Full,
            device: DeviceId::default(),
            workspace_limit: DEFAULT_WORKSPACE_LIMIT,
            force_fallback_ops: BTreeSet::new(),
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            precision_overrides: BTreeMap::new(),
            strict_conversion: false,
            lowering: true,
            serial_builds: false,
        }
    }

    pub fn with_precision(mut self, precision: PrecisionMode) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = DeviceId::new(device);
        self
    }

    pub fn with_workspace_limit(mut self, bytes: u64) -> Self {
        self.workspace_limit = bytes;
        self
    }

    pub fn with_forced_fallback(mut self, kind: OpKind) -> Self {
        self.force_fallback_ops.insert(kind);
        self
    }

    pub fn with_min_segment_size(mut self, size: usize) -> Self {
        self.min_segment_size = size;
        self
    }

    pub fn with_precision_override(mut self, node: NodeId, precision: PrecisionMode) -> Self {
        self.precision_overrides.insert(node, precision);
        self
    }

    pub fn with_strict_conversion(mut self, strict: bool) -> Self {
        self.strict_conversion = strict;
        self
    }

    pub fn with_lowering(mut self, enabled: bool) -> Self {
        self.lowering = enabled;
        self
    }

    pub fn with_serial_builds(mut self, serial: bool) -> Self {
        self.serial_builds = serial;
        self
    }

    /// Effective minimum segment size; zero behaves like one.
    pub fn effective_min_segment_size(&self) -> usize {
        self.min_segment_size.max(1)
    }

    /// Forced kinds from the configuration merged with `HYLO_FORCE_FALLBACK`.
    pub fn forced_fallback(&self) -> BTreeSet<OpKind> {
        let mut forced = self.force_fallback_ops.clone();
        forced.extend(env::forced_fallback_kinds().iter().copied());
        forced
    }

    pub fn serial_builds(&self) -> bool {
        self.serial_builds || env::serial_builds()
    }

    pub fn validate(&self, graph: &Graph) -> Result<(), CompileError> {
        if self.input_specs.len() != graph.inputs.len() {
            return Err(CompileError::InvalidConfig(format!(
                "graph '{}' has {} inputs but {} input specs were given",
                graph.name,
                graph.inputs.len(),
                self.input_specs.len()
            )));
        }
        if self.workspace_limit == 0 {
            return Err(CompileError::InvalidConfig(
                "workspace limit must be positive".to_string(),
            ));
        }
        if self.device.as_str().trim().is_empty() {
            return Err(CompileError::InvalidConfig("device id is empty".to_string()));
        }
        Ok(())
    }

    pub fn digest(&self) -> u64 {
        digest(self)
    }
}
