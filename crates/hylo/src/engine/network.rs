//! Layer-level network definition handed to an engine runtime for building.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PrecisionMode;
use crate::graph::{DType, TensorLiteral, TensorSpec};

/// Handle to a tensor inside a [`NetworkDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorRef(pub u32);

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
    Clip { min: f32, max: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryKind {
    Exp,
    Log,
    Neg,
    Abs,
    Sqrt,
}

/// Elementwise binary ops. Operands must share a rank; dims must match or be 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementWiseOp {
    Sum,
    Sub,
    Prod,
    Div,
    Max,
    Min,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingKind {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Constant {
        weights: TensorLiteral,
    },
    Identity,
    Cast {
        dtype: DType,
    },
    Activation(ActivationKind),
    Unary(UnaryKind),
    ElementWise(ElementWiseOp),
    /// Batched matrix product over the trailing two axes.
    MatrixMultiply {
        transpose_a: bool,
        transpose_b: bool,
    },
    Convolution {
        kernel: TensorLiteral,
        bias: Option<TensorLiteral>,
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
        groups: usize,
    },
    Pooling {
        kind: PoolingKind,
        window: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        count_include_pad: bool,
    },
    /// Per-channel affine transform on axis 1: `x * scale[c] + shift[c]`.
    Scale {
        scale: Vec<f32>,
        shift: Vec<f32>,
    },
    SoftMax {
        axis: usize,
    },
    Reduce {
        op: LayerReduceOp,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    /// Optional transpose followed by an optional static reshape.
    Shuffle {
        first_transpose: Option<Vec<usize>>,
        reshape: Option<Vec<usize>>,
    },
    Concatenation {
        axis: usize,
    },
    Slice {
        axis: usize,
        start: usize,
        size: usize,
        stride: usize,
    },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Constant { .. } => "constant",
            LayerKind::Identity => "identity",
            LayerKind::Cast { .. } => "cast",
            LayerKind::Activation(_) => "activation",
            LayerKind::Unary(_) => "unary",
            LayerKind::ElementWise(_) => "elementwise",
            LayerKind::MatrixMultiply { .. } => "matrix_multiply",
            LayerKind::Convolution { .. } => "convolution",
            LayerKind::Pooling { .. } => "pooling",
            LayerKind::Scale { .. } => "scale",
            LayerKind::SoftMax { .. } => "softmax",
            LayerKind::Reduce { .. } => "reduce",
            LayerKind::Shuffle { .. } => "shuffle",
            LayerKind::Concatenation { .. } => "concatenation",
            LayerKind::Slice { .. } => "slice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<TensorRef>,
    pub outputs: Vec<TensorRef>,
    pub precision: PrecisionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub name: String,
    pub tensor: TensorRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("unknown tensor {0}")]
    UnknownTensor(TensorRef),
    #[error("tensor {tensor} is read by layer '{layer}' before it is produced")]
    UseBeforeDefinition { tensor: TensorRef, layer: String },
    #[error("network marks no outputs")]
    NoOutputs,
    #[error("binding name '{0}' is used twice")]
    DuplicateBinding(String),
}

/// Layers are appended in execution order; tensors are typed at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    tensors: Vec<TensorSpec>,
    inputs: Vec<NetworkBinding>,
    layers: Vec<Layer>,
    outputs: Vec<NetworkBinding>,
}

impl NetworkDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>, spec: TensorSpec) -> TensorRef {
        let tensor = self.fresh_tensor(spec);
        self.inputs.push(NetworkBinding {
            name: name.into(),
            tensor,
        });
        tensor
    }

    pub fn add_layer(
        &mut self,
        name: impl Into<String>,
        kind: LayerKind,
        inputs: &[TensorRef],
        outputs: Vec<TensorSpec>,
        precision: PrecisionMode,
    ) -> Result<Vec<TensorRef>, NetworkError> {
        for input in inputs {
            self.tensor_spec(*input)?;
        }
        let outputs = outputs
            .into_iter()
            .map(|spec| self.fresh_tensor(spec))
            .collect::<Vec<_>>();
        self.layers.push(Layer {
            name: name.into(),
            kind,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
            precision,
        });
        Ok(outputs)
    }

    pub fn mark_output(
        &mut self,
        name: impl Into<String>,
        tensor: TensorRef,
    ) -> Result<(), NetworkError> {
        self.tensor_spec(tensor)?;
        let name = name.into();
        if self.outputs.iter().any(|binding| binding.name == name) {
            return Err(NetworkError::DuplicateBinding(name));
        }
        self.outputs.push(NetworkBinding { name, tensor });
        Ok(())
    }

    pub fn tensor_spec(&self, tensor: TensorRef) -> Result<&TensorSpec, NetworkError> {
        self.tensors
            .get(tensor.0 as usize)
            .ok_or(NetworkError::UnknownTensor(tensor))
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn inputs(&self) -> &[NetworkBinding] {
        &self.inputs
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn outputs(&self) -> &[NetworkBinding] {
        &self.outputs
    }

    /// Checks that layers only read tensors produced earlier and that outputs exist.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.outputs.is_empty() {
            return Err(NetworkError::NoOutputs);
        }
        let mut defined = vec![false; self.tensors.len()];
        for binding in &self.inputs {
            let slot = defined
                .get_mut(binding.tensor.0 as usize)
                .ok_or(NetworkError::UnknownTensor(binding.tensor))?;
            *slot = true;
        }
        for layer in &self.layers {
            for input in &layer.inputs {
                if !defined.get(input.0 as usize).copied().unwrap_or(false) {
                    return Err(NetworkError::UseBeforeDefinition {
                        tensor: *input,
                        layer: layer.name.clone(),
                    });
                }
            }
            for output in &layer.outputs {
                let slot = defined
                    .get_mut(output.0 as usize)
                    .ok_or(NetworkError::UnknownTensor(*output))?;
                *slot = true;
            }
        }
        for binding in &self.outputs {
            if !defined.get(binding.tensor.0 as usize).copied().unwrap_or(false) {
                return Err(NetworkError::UseBeforeDefinition {
                    tensor: binding.tensor,
                    layer: binding.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn fresh_tensor(&mut self, spec: TensorSpec) -> TensorRef {
        let tensor = TensorRef(self.tensors.len() as u32);
        self.tensors.push(spec);
        tensor
    }
}
