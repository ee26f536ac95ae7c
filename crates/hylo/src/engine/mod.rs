//! Engine runtime seam: network definitions go in, serialized engines come out,
//! and loaded engines execute asynchronously on a device.

mod artifact;
pub mod builder;
mod cache;
pub mod network;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{DType, Shape, TensorLiteral, TensorSpec};

pub use artifact::{EngineArtifact, EngineManifest, IoBinding, ENGINE_ARTIFACT_VERSION};
pub use cache::{EngineCache, EngineCacheKey};
pub use network::{
    ActivationKind, ElementWiseOp, Layer, LayerKind, LayerReduceOp, NetworkBinding,
    NetworkDefinition, NetworkError, PoolingKind, TensorRef, UnaryKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrecisionMode {
    #[default]
    Full,
    /// Half-precision kernels may be selected for floating point layers.
    Reduced,
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrecisionMode::Full => f.write_str("full"),
            PrecisionMode::Reduced => f.write_str("reduced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::new("gpu:0")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub device: DeviceId,
    pub precision: PrecisionMode,
    pub workspace_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineRuntimeError {
    message: String,
}

impl EngineRuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type EngineResult<T> = Result<T, EngineRuntimeError>;

/// Dense device-resident tensor. Bytes are little-endian in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub bytes: Arc<[u8]>,
}

impl DeviceBuffer {
    pub fn new(dtype: DType, dims: Vec<usize>, bytes: impl Into<Arc<[u8]>>) -> EngineResult<Self> {
        let bytes = bytes.into();
        let expected = dims.iter().product::<usize>() * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(EngineRuntimeError::new(format!(
                "buffer of {dtype}{dims:?} needs {expected} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { dtype, dims, bytes })
    }

    pub fn from_literal(literal: &TensorLiteral) -> EngineResult<Self> {
        let dims = literal.spec.shape.static_dims().ok_or_else(|| {
            EngineRuntimeError::new(format!(
                "literal {} has dynamic dimensions",
                literal.spec
            ))
        })?;
        Self::new(literal.spec.dtype, dims, literal.bytes.clone())
    }

    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::new(
            TensorSpec::new(self.dtype, Shape::from_static(&self.dims)),
            self.bytes.clone(),
        )
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::with_static(self.dtype, &self.dims)
    }
}

/// A vendor engine library. Implementations own device memory and must be
/// safe to share between compilations.
pub trait EngineRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Artifacts carrying any other tag are refused at load time.
    fn version_tag(&self) -> &str;

    /// Whether builds on the same device may overlap.
    fn supports_concurrent_builds(&self) -> bool {
        false
    }

    /// Builds a serialized engine from a network definition.
    fn build(&self, network: &NetworkDefinition, config: &BuildConfig) -> EngineResult<Vec<u8>>;

    /// Loads a serialized engine and binds it to its manifest.
    fn load(
        &self,
        blob: &[u8],
        manifest: &EngineManifest,
    ) -> EngineResult<Box<dyn ExecutionContext>>;
}

/// A loaded engine ready to run. Inputs and outputs follow manifest order.
pub trait ExecutionContext: Send {
    fn enqueue(&mut self, inputs: Vec<DeviceBuffer>) -> EngineResult<Box<dyn PendingExecution>>;
}

/// Handle to outstanding device work.
pub trait PendingExecution: Send {
    /// Blocks until the work completes and returns its outputs.
    fn synchronize(self: Box<Self>) -> EngineResult<Vec<DeviceBuffer>>;
}
