//! The compiled artifact: a rewritten graph with embedded engines.

use std::sync::Arc;
use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{EngineArtifact, EngineRuntime, ENGINE_ARTIFACT_VERSION};
use crate::graph::{Graph, NodeId, Operation, TensorSpec};
use crate::propagate::ValueTypes;
use crate::report::CompileReport;
use crate::runtime::{ExecutionError, HostInterpreter, LoadedModule};

/// Frozen module format version enforced on load.
pub const MODULE_FORMAT_VERSION: &str = "hylo.module.v1";

fn default_format_version() -> String {
    MODULE_FORMAT_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModule {
    #[serde(default = "default_format_version")]
    pub format_version: String,
    pub graph: Graph,
    pub types: ValueTypes,
    pub input_specs: Vec<TensorSpec>,
    pub report: CompileReport,
}

/// An embedded engine that the running engine runtime cannot load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine at node {node} was built by {runtime} '{found}', expected '{expected}'")]
pub struct IncompatibleArtifact {
    pub node: NodeId,
    pub runtime: String,
    pub found: String,
    pub expected: String,
}

#[derive(Debug, Error)]
pub enum ModuleSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("module format version '{found}' does not match expected '{expected}'")]
    FormatVersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("engine artifact version {found} at node {node} is not supported")]
    ArtifactVersionMismatch { node: NodeId, found: u32 },
    #[error(transparent)]
    IncompatibleArtifact(#[from] IncompatibleArtifact),
}

#[derive(Debug, Error)]
pub enum ModuleIoError {
    #[error(transparent)]
    Serialization(#[from] ModuleSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CompiledModule {
    pub fn new(graph: Graph, types: ValueTypes, input_specs: Vec<TensorSpec>, report: CompileReport) -> Self {
        Self {
            format_version: MODULE_FORMAT_VERSION.to_string(),
            graph,
            types,
            input_specs,
            report,
        }
    }

    /// Embedded engines with the node that invokes each.
    pub fn engines(&self) -> impl Iterator<Item = (NodeId, &EngineArtifact)> {
        self.graph.nodes.iter().filter_map(|node| match &node.op {
            Operation::EngineCall(spec) => Some((node.id, &spec.artifact)),
            _ => None,
        })
    }

    pub fn engine_count(&self) -> usize {
        self.engines().count()
    }

    /// Checks every embedded engine against the runtime that will load it.
    pub fn check_compatible(&self, runtime: &dyn EngineRuntime) -> Result<(), IncompatibleArtifact> {
        for (node, artifact) in self.engines() {
            let manifest = &artifact.manifest;
            if manifest.runtime != runtime.name() || manifest.version_tag != runtime.version_tag() {
                return Err(IncompatibleArtifact {
                    node,
                    runtime: manifest.runtime.clone(),
                    found: manifest.version_tag.clone(),
                    expected: runtime.version_tag().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Binds the module to a host interpreter and loads its engines.
    pub fn load<H: HostInterpreter>(
        self,
        host: Arc<H>,
        runtime: &dyn EngineRuntime,
    ) -> Result<LoadedModule<H>, ExecutionError> {
        LoadedModule::load(self, host, runtime)
    }

    pub fn to_json_string(&self) -> Result<String, ModuleSerdeError> {
        serde_json::to_string_pretty(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_json_str(src: &str, runtime: &dyn EngineRuntime) -> Result<Self, ModuleSerdeError> {
        let module: CompiledModule = serde_json::from_str(src)?;
        module.into_checked(runtime)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ModuleSerdeError> {
        bincode::serialize(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8], runtime: &dyn EngineRuntime) -> Result<Self, ModuleSerdeError> {
        let module: CompiledModule = bincode::deserialize(bytes)?;
        module.into_checked(runtime)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ModuleIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ModuleIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P, runtime: &dyn EngineRuntime) -> Result<Self, ModuleIoError> {
        let contents = fs::read_to_string(path)?;
        Ok(CompiledModule::from_json_str(&contents, runtime)?)
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<(), ModuleIoError> {
        let bytes = self.to_bincode_bytes()?;
        fs::write(path, bytes).map_err(ModuleIoError::from)
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P, runtime: &dyn EngineRuntime) -> Result<Self, ModuleIoError> {
        let bytes = fs::read(path)?;
        Ok(CompiledModule::from_bincode_slice(&bytes, runtime)?)
    }

    fn into_checked(mut self, runtime: &dyn EngineRuntime) -> Result<Self, ModuleSerdeError> {
        self.format_version = normalize_format_version(self.format_version)?;
        for (node, artifact) in self.engines() {
            if artifact.manifest.artifact_version != ENGINE_ARTIFACT_VERSION {
                return Err(ModuleSerdeError::ArtifactVersionMismatch {
                    node,
                    found: artifact.manifest.artifact_version,
                });
            }
        }
        self.check_compatible(runtime)?;
        Ok(self)
    }
}

fn normalize_format_version(version: String) -> Result<String, ModuleSerdeError> {
    if version.is_empty() {
        return Ok(MODULE_FORMAT_VERSION.to_string());
    }
    if version == MODULE_FORMAT_VERSION {
        Ok(version)
    } else {
        Err(ModuleSerdeError::FormatVersionMismatch {
            found: version,
            expected: MODULE_FORMAT_VERSION,
        })
    }
}
