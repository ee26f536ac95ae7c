use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{DType, TensorLiteral, TensorSpec};
use crate::engine::EngineArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Log,
    Neg,
    Abs,
    Sqrt,
    Erf,
}

impl UnaryOp {
    /// Transcendental ops are only defined over floating point inputs.
    pub fn requires_float(self) -> bool {
        !matches!(self, UnaryOp::Relu | UnaryOp::Neg | UnaryOp::Abs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Pow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampSpec {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyReluSpec {
    pub negative_slope: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearSpec {
    pub has_bias: bool,
}

/// NCHW convolution. Operands are `[input, weight]` plus `bias` when `has_bias`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
    pub has_bias: bool,
}

impl Default for Conv2dSpec {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
            has_bias: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dSpec {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    /// Only meaningful for average pooling.
    #[serde(default)]
    pub count_include_pad: bool,
}

impl Pool2dSpec {
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel: [kernel, kernel],
            stride: [stride, stride],
            padding: [padding, padding],
            count_include_pad: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptivePool2dSpec {
    pub output_size: [usize; 2],
}

/// Operands: `[input, gamma, beta, running_mean, running_var]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormSpec {
    pub eps: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftmaxSpec {
    pub axis: isize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Mean,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<isize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgMaxSpec {
    pub axis: isize,
    pub keepdims: bool,
}

/// Produces `(values, indices)` along `axis`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopKSpec {
    pub k: usize,
    pub axis: isize,
    pub largest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumSumSpec {
    pub axis: isize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReshapeDim {
    Explicit(usize),
    Infer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<ReshapeDim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenSpec {
    pub start_axis: isize,
    pub end_axis: isize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSpec {
    pub axis: isize,
}

/// Strided slice along one axis. `start`/`end` follow Python indexing rules
/// (negative values count from the end, out of range values are clamped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub axis: isize,
    pub start: i64,
    pub end: i64,
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutSpec {
    pub p: f64,
}

/// Attribute values for opaque custom operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CustomAttr {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
}

/// Operation with no converter; the host interpreter resolves `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSpec {
    pub target: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, CustomAttr>,
    /// Declared result types; custom ops cannot be shape-inferred otherwise.
    pub outputs: Vec<TensorSpec>,
}

/// Invocation of a built engine that replaced a convertible segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCallSpec {
    pub segment: u32,
    pub artifact: EngineArtifact,
}

/// Declarative form of every operation a graph may contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Clamp(ClampSpec),
    LeakyRelu(LeakyReluSpec),
    MatMul,
    Linear(LinearSpec),
    Conv2d(Conv2dSpec),
    MaxPool2d(Pool2dSpec),
    AvgPool2d(Pool2dSpec),
    AdaptiveAvgPool2d(AdaptivePool2dSpec),
    BatchNorm(BatchNormSpec),
    Softmax(SoftmaxSpec),
    Reduce(ReduceSpec),
    ArgMax(ArgMaxSpec),
    TopK(TopKSpec),
    CumSum(CumSumSpec),
    Reshape(ReshapeSpec),
    Flatten(FlattenSpec),
    Transpose(TransposeSpec),
    Squeeze(AxisSpec),
    Unsqueeze(AxisSpec),
    Concat(AxisSpec),
    Slice(SliceSpec),
    Cast(CastSpec),
    Dropout(DropoutSpec),
    Identity,
    /// Marks its operand as a value to be baked into an engine as a constant.
    PlaceholderConst,
    Custom(CustomSpec),
    EngineCall(EngineCallSpec),
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        OpKind::from_op(self)
    }

    /// Number of results the operation produces.
    pub fn result_count(&self) -> usize {
        match self {
            Operation::TopK(_) => 2,
            Operation::Custom(spec) => spec.outputs.len(),
            Operation::EngineCall(spec) => spec.artifact.manifest.outputs.len(),
            _ => 1,
        }
    }
}

/// Discriminant of [`Operation`], used as the converter registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Constant,
    Unary,
    Binary,
    Clamp,
    LeakyRelu,
    MatMul,
    Linear,
    Conv2d,
    MaxPool2d,
    AvgPool2d,
    AdaptiveAvgPool2d,
    BatchNorm,
    Softmax,
    Reduce,
    ArgMax,
    TopK,
    CumSum,
    Reshape,
    Flatten,
    Transpose,
    Squeeze,
    Unsqueeze,
    Concat,
    Slice,
    Cast,
    Dropout,
    Identity,
    PlaceholderConst,
    Custom,
    EngineCall,
}

impl OpKind {
    pub const ALL: [OpKind; 30] = [
        OpKind::Constant,
        OpKind::Unary,
        OpKind::Binary,
        OpKind::Clamp,
        OpKind::LeakyRelu,
        OpKind::MatMul,
        OpKind::Linear,
        OpKind::Conv2d,
        OpKind::MaxPool2d,
        OpKind::AvgPool2d,
        OpKind::AdaptiveAvgPool2d,
        OpKind::BatchNorm,
        OpKind::Softmax,
        OpKind::Reduce,
        OpKind::ArgMax,
        OpKind::TopK,
        OpKind::CumSum,
        OpKind::Reshape,
        OpKind::Flatten,
        OpKind::Transpose,
        OpKind::Squeeze,
        OpKind::Unsqueeze,
        OpKind::Concat,
        OpKind::Slice,
        OpKind::Cast,
        OpKind::Dropout,
        OpKind::Identity,
        OpKind::PlaceholderConst,
        OpKind::Custom,
        OpKind::EngineCall,
    ];

    pub fn from_op(op: &Operation) -> Self {
        match op {
            Operation::Constant(_) => OpKind::Constant,
            Operation::Unary(_) => OpKind::Unary,
            Operation::Binary(_) => OpKind::Binary,
            Operation::Clamp(_) => OpKind::Clamp,
            Operation::LeakyRelu(_) => OpKind::LeakyRelu,
            Operation::MatMul => OpKind::MatMul,
            Operation::Linear(_) => OpKind::Linear,
            Operation::Conv2d(_) => OpKind::Conv2d,
            Operation::MaxPool2d(_) => OpKind::MaxPool2d,
            Operation::AvgPool2d(_) => OpKind::AvgPool2d,
            Operation::AdaptiveAvgPool2d(_) => OpKind::AdaptiveAvgPool2d,
            Operation::BatchNorm(_) => OpKind::BatchNorm,
            Operation::Softmax(_) => OpKind::Softmax,
            Operation::Reduce(_) => OpKind::Reduce,
            Operation::ArgMax(_) => OpKind::ArgMax,
            Operation::TopK(_) => OpKind::TopK,
            Operation::CumSum(_) => OpKind::CumSum,
            Operation::Reshape(_) => OpKind::Reshape,
            Operation::Flatten(_) => OpKind::Flatten,
            Operation::Transpose(_) => OpKind::Transpose,
            Operation::Squeeze(_) => OpKind::Squeeze,
            Operation::Unsqueeze(_) => OpKind::Unsqueeze,
            Operation::Concat(_) => OpKind::Concat,
            Operation::Slice(_) => OpKind::Slice,
            Operation::Cast(_) => OpKind::Cast,
            Operation::Dropout(_) => OpKind::Dropout,
            Operation::Identity => OpKind::Identity,
            Operation::PlaceholderConst => OpKind::PlaceholderConst,
            Operation::Custom(_) => OpKind::Custom,
            Operation::EngineCall(_) => OpKind::EngineCall,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Constant => "constant",
            OpKind::Unary => "unary",
            OpKind::Binary => "binary",
            OpKind::Clamp => "clamp",
            OpKind::LeakyRelu => "leaky_relu",
            OpKind::MatMul => "matmul",
            OpKind::Linear => "linear",
            OpKind::Conv2d => "conv2d",
            OpKind::MaxPool2d => "max_pool2d",
            OpKind::AvgPool2d => "avg_pool2d",
            OpKind::AdaptiveAvgPool2d => "adaptive_avg_pool2d",
            OpKind::BatchNorm => "batch_norm",
            OpKind::Softmax => "softmax",
            OpKind::Reduce => "reduce",
            OpKind::ArgMax => "argmax",
            OpKind::TopK => "topk",
            OpKind::CumSum => "cumsum",
            OpKind::Reshape => "reshape",
            OpKind::Flatten => "flatten",
            OpKind::Transpose => "transpose",
            OpKind::Squeeze => "squeeze",
            OpKind::Unsqueeze => "unsqueeze",
            OpKind::Concat => "concat",
            OpKind::Slice => "slice",
            OpKind::Cast => "cast",
            OpKind::Dropout => "dropout",
            OpKind::Identity => "identity",
            OpKind::PlaceholderConst => "placeholder_const",
            OpKind::Custom => "custom",
            OpKind::EngineCall => "engine_call",
        }
    }

    /// Kinds that perform no computation and do not count towards segment size.
    pub fn is_constant_source(self) -> bool {
        matches!(self, OpKind::Constant)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation kind '{0}'")]
pub struct UnknownOpKind(pub String);

impl FromStr for OpKind {
    type Err = UnknownOpKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        OpKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == needle)
            .ok_or_else(|| UnknownOpKind(s.trim().to_string()))
    }
}
