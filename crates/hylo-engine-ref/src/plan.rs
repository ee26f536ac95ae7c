use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use hylo::engine::{DeviceId, LayerKind, NetworkDefinition, PrecisionMode, TensorRef};

const PLAN_MAGIC: &[u8; 8] = b"HYLOPLAN";

/// Serialized form of a built engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnginePlan {
    pub version_tag: String,
    pub device: DeviceId,
    pub precision: PrecisionMode,
    pub workspace_bytes: u64,
    pub network: NetworkDefinition,
}

impl EnginePlan {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).context("encoding engine plan")?;
        let mut blob = Vec::with_capacity(PLAN_MAGIC.len() + body.len());
        blob.extend_from_slice(PLAN_MAGIC);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        let Some(body) = blob.strip_prefix(PLAN_MAGIC) else {
            bail!("blob is not a reference engine plan");
        };
        bincode::deserialize(body).context("decoding engine plan")
    }
}

/// Bytes of scratch memory the plan needs: every intermediate tensor stays
/// resident, constants included. Dynamic extents count as one.
pub fn estimate_workspace(network: &NetworkDefinition) -> Result<u64> {
    let mut total = 0u64;
    for index in 0..network.tensor_count() {
        let spec = network.tensor_spec(TensorRef(index as u32))?;
        let elements = spec
            .shape
            .dims()
            .iter()
            .map(|dim| dim.as_static().unwrap_or(1) as u64)
            .product::<u64>();
        total = total.saturating_add(elements.saturating_mul(spec.dtype.size_in_bytes() as u64));
    }
    Ok(total)
}

/// Names of layer kinds the plan contains, in first-use order.
pub fn layer_kinds(network: &NetworkDefinition) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    for layer in network.layers() {
        let name = layer.kind.name();
        if !kinds.contains(&name) {
            kinds.push(name);
        }
    }
    kinds
}

pub(crate) fn is_float_layer(kind: &LayerKind) -> bool {
    !matches!(
        kind,
        LayerKind::Cast { .. } | LayerKind::Shuffle { .. } | LayerKind::Slice { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hylo::graph::{DType, TensorSpec};

    fn tiny_network() -> NetworkDefinition {
        let mut network = NetworkDefinition::new();
        let input = network.add_input("input_0", TensorSpec::with_static(DType::F32, &[2, 3]));
        let out = network
            .add_layer(
                "relu",
                LayerKind::Activation(hylo::engine::ActivationKind::Relu),
                &[input],
                vec![TensorSpec::with_static(DType::F32, &[2, 3])],
                PrecisionMode::Full,
            )
            .expect("layer");
        network.mark_output("output_0", out[0]).expect("output");
        network
    }

    #[test]
    fn plan_blob_carries_magic_header() {
        let plan = EnginePlan {
            version_tag: "v".to_string(),
            device: DeviceId::default(),
            precision: PrecisionMode::Full,
            workspace_bytes: 48,
            network: tiny_network(),
        };
        let blob = plan.encode().expect("encode");
        assert!(blob.starts_with(b"HYLOPLAN"));
        assert_eq!(EnginePlan::decode(&blob).expect("decode"), plan);
        assert!(EnginePlan::decode(&blob[1..]).is_err());
    }

    #[test]
    fn workspace_counts_every_tensor() {
        assert_eq!(estimate_workspace(&tiny_network()).expect("estimate"), 48);
        assert_eq!(layer_kinds(&tiny_network()), vec!["activation"]);
    }
}
