use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};

use super::{DeviceId, PrecisionMode};
use crate::graph::TensorSpec;

pub const ENGINE_ARTIFACT_VERSION: u32 = 1;

/// Named, typed engine input or output, in boundary order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoBinding {
    pub name: String,
    pub spec: TensorSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineManifest {
    pub artifact_version: u32,
    pub inputs: Vec<IoBinding>,
    pub outputs: Vec<IoBinding>,
    pub precision: PrecisionMode,
    pub device: DeviceId,
    /// Runtime name and version tag the blob was produced by.
    pub runtime: String,
    pub version_tag: String,
    pub built_at_unix_ms: u64,
    /// Fingerprint of the converted segment, used as the build cache key.
    pub fingerprint: u64,
    pub layer_count: usize,
    /// Decisions recorded while converting the segment.
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

/// Opaque serialized engine plus the manifest needed to bind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineArtifact {
    pub manifest: EngineManifest,
    pub blob: Arc<[u8]>,
}

impl EngineArtifact {
    pub fn new(manifest: EngineManifest, blob: Vec<u8>) -> Self {
        Self {
            manifest,
            blob: Arc::<[u8]>::from(blob),
        }
    }

    pub fn blob_len(&self) -> usize {
        self.blob.len()
    }
}

impl Serialize for EngineArtifact {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("EngineArtifact", 2)?;
        state.serialize_field("manifest", &self.manifest)?;
        state.serialize_field("blob", &self.blob.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for EngineArtifact {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct EngineArtifactHelper {
            manifest: EngineManifest,
            blob: Vec<u8>,
        }

        let helper = EngineArtifactHelper::deserialize(deserializer)?;
        Ok(EngineArtifact::new(helper.manifest, helper.blob))
    }
}
