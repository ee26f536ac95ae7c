use std::sync::Arc;

use hylo::graph::{
    BinaryOp, DType, Node, Operation, ReduceKind, Shape, TensorLiteral, TensorSpec, UnaryOp,
};
use hylo::propagate::infer_node;
use hylo::runtime::{HostError, HostInterpreter, HostResult};
use hylo::shape::normalize_axis;

use crate::kernels::{self, Conv2dParams, PoolMode};

#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
    Si64(Arc<[i64]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::Si32(_) => DType::Si32,
            TensorData::Si64(_) => DType::Si64,
            TensorData::Bool(_) => DType::I1,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Si64(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CpuTensor {
    pub fn new(dims: &[usize], data: TensorData) -> HostResult<Self> {
        let expected = dims.iter().product::<usize>();
        if data.len() != expected {
            return Err(HostError::execution(format!(
                "buffer holds {} elements but shape {dims:?} needs {expected}",
                data.len()
            )));
        }
        Ok(Self {
            spec: TensorSpec::with_static(data.dtype(), dims),
            data,
        })
    }

    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> HostResult<Self> {
        Self::new(dims, TensorData::F32(Arc::from(values)))
    }

    pub fn from_i64(dims: &[usize], values: Vec<i64>) -> HostResult<Self> {
        Self::new(dims, TensorData::Si64(Arc::from(values)))
    }

    pub fn dims(&self) -> HostResult<Vec<usize>> {
        static_dims(&self.spec.shape)
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Si64(values) => Some(values),
            _ => None,
        }
    }

    fn f32s(&self, what: &str) -> HostResult<&[f32]> {
        self.as_f32().ok_or_else(|| {
            HostError::execution(format!("{what} expects f32 data, got {}", self.spec.dtype))
        })
    }
}

/// Kernel override hook consulted before the built-in kernels; the only way
/// `Custom` nodes can execute.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        node: &Node,
        inputs: &[CpuTensor],
        outputs: &[TensorSpec],
    ) -> Option<HostResult<Vec<CpuTensor>>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _node: &Node,
        _inputs: &[CpuTensor],
        _outputs: &[TensorSpec],
    ) -> Option<HostResult<Vec<CpuTensor>>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuInterpreter<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuInterpreter<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self { interceptor }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuInterpreter<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuInterpreter<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuInterpreter = GenericCpuInterpreter<NoopInterceptor>;

impl<I: CpuKernelInterceptor> HostInterpreter for GenericCpuInterpreter<I> {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "ref-cpu"
    }

    fn materialize(&self, literal: &TensorLiteral) -> HostResult<CpuTensor> {
        literal_to_tensor(literal)
    }

    fn to_literal(&self, tensor: &CpuTensor) -> HostResult<TensorLiteral> {
        Ok(tensor_to_literal(tensor))
    }

    fn spec_of(&self, tensor: &CpuTensor) -> TensorSpec {
        tensor.spec.clone()
    }

    fn execute_node(
        &self,
        node: &Node,
        inputs: &[CpuTensor],
        outputs: &[TensorSpec],
    ) -> HostResult<Vec<CpuTensor>> {
        if let Some(result) = self.interceptor.try_execute(node, inputs, outputs) {
            return result;
        }
        execute_operation(node, inputs)
    }
}

pub fn literal_to_tensor(literal: &TensorLiteral) -> HostResult<CpuTensor> {
    let dims = static_dims(&literal.spec.shape)?;
    if !literal.is_consistent() {
        return Err(HostError::execution(format!(
            "literal of {} carries {} bytes",
            literal.spec,
            literal.byte_len()
        )));
    }
    let bytes = &literal.bytes;
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        ),
        DType::Si32 => TensorData::Si32(
            bytes
                .chunks_exact(4)
                .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        ),
        DType::Si64 => TensorData::Si64(
            bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    i64::from_le_bytes(raw)
                })
                .collect(),
        ),
        DType::I1 => TensorData::Bool(bytes.iter().map(|&b| u8::from(b != 0)).collect()),
    };
    CpuTensor::new(&dims, data)
}

pub fn tensor_to_literal(tensor: &CpuTensor) -> TensorLiteral {
    let bytes: Arc<[u8]> = match &tensor.data {
        TensorData::F32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Si32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Si64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Bool(values) => Arc::clone(values),
    };
    TensorLiteral::new(tensor.spec.clone(), bytes)
}

/// Converts element type, truncating floats towards zero with saturation.
pub fn cast(tensor: &CpuTensor, dtype: DType) -> HostResult<CpuTensor> {
    let dims = tensor.dims()?;
    if tensor.data.dtype() == dtype {
        return Ok(tensor.clone());
    }
    let as_f64: Vec<f64> = match &tensor.data {
        TensorData::F32(values) => values.iter().map(|&v| f64::from(v)).collect(),
        TensorData::Si32(values) => values.iter().map(|&v| f64::from(v)).collect(),
        TensorData::Si64(values) => {
            let data = match dtype {
                DType::Si32 => TensorData::Si32(values.iter().map(|&v| v as i32).collect()),
                DType::F32 => TensorData::F32(values.iter().map(|&v| v as f32).collect()),
                DType::I1 => TensorData::Bool(values.iter().map(|&v| u8::from(v != 0)).collect()),
                DType::Si64 => TensorData::Si64(values.clone()),
            };
            return CpuTensor::new(&dims, data);
        }
        TensorData::Bool(values) => values.iter().map(|&v| f64::from(v)).collect(),
    };
    let data = match dtype {
        DType::F32 => TensorData::F32(as_f64.iter().map(|&v| v as f32).collect()),
        DType::Si32 => TensorData::Si32(as_f64.iter().map(|&v| v as i32).collect()),
        DType::Si64 => TensorData::Si64(as_f64.iter().map(|&v| v as i64).collect()),
        DType::I1 => TensorData::Bool(as_f64.iter().map(|&v| u8::from(v != 0.0)).collect()),
    };
    CpuTensor::new(&dims, data)
}

/// Same data, new static shape.
pub fn reshape(tensor: &CpuTensor, dims: &[usize]) -> HostResult<CpuTensor> {
    CpuTensor::new(dims, tensor.data.clone())
}

pub fn transpose(tensor: &CpuTensor, perm: &[usize]) -> HostResult<CpuTensor> {
    let dims = tensor.dims()?;
    let (data, out_dims) = match &tensor.data {
        TensorData::F32(v) => wrap(kernels::transpose(v, &dims, perm)?, TensorData::F32),
        TensorData::Si32(v) => wrap(kernels::transpose(v, &dims, perm)?, TensorData::Si32),
        TensorData::Si64(v) => wrap(kernels::transpose(v, &dims, perm)?, TensorData::Si64),
        TensorData::Bool(v) => wrap(kernels::transpose(v, &dims, perm)?, TensorData::Bool),
    };
    CpuTensor::new(&out_dims, data)
}

pub fn slice_range(tensor: &CpuTensor, axis: usize, start: usize, size: usize, stride: usize) -> HostResult<CpuTensor> {
    let dims = tensor.dims()?;
    let (data, out_dims) = match &tensor.data {
        TensorData::F32(v) => wrap(kernels::slice_range(v, &dims, axis, start, size, stride)?, TensorData::F32),
        TensorData::Si32(v) => wrap(kernels::slice_range(v, &dims, axis, start, size, stride)?, TensorData::Si32),
        TensorData::Si64(v) => wrap(kernels::slice_range(v, &dims, axis, start, size, stride)?, TensorData::Si64),
        TensorData::Bool(v) => wrap(kernels::slice_range(v, &dims, axis, start, size, stride)?, TensorData::Bool),
    };
    CpuTensor::new(&out_dims, data)
}

pub fn concat(tensors: &[&CpuTensor], axis: usize) -> HostResult<CpuTensor> {
    let dims = tensors
        .iter()
        .map(|tensor| tensor.dims())
        .collect::<HostResult<Vec<_>>>()?;
    let mismatch = || HostError::execution("concat operands must share a dtype");
    let (data, out_dims) = match tensors.first().map(|tensor| &tensor.data) {
        Some(TensorData::F32(_)) => {
            let parts = tensors
                .iter()
                .zip(&dims)
                .map(|(tensor, dims)| tensor.as_f32().map(|v| (v, dims.as_slice())).ok_or_else(mismatch))
                .collect::<HostResult<Vec<_>>>()?;
            wrap(kernels::concat(&parts, axis)?, TensorData::F32)
        }
        Some(TensorData::Si64(_)) => {
            let parts = tensors
                .iter()
                .zip(&dims)
                .map(|(tensor, dims)| tensor.as_i64().map(|v| (v, dims.as_slice())).ok_or_else(mismatch))
                .collect::<HostResult<Vec<_>>>()?;
            wrap(kernels::concat(&parts, axis)?, TensorData::Si64)
        }
        Some(TensorData::Si32(_)) => {
            let parts = tensors
                .iter()
                .zip(&dims)
                .map(|(tensor, dims)| match &tensor.data {
                    TensorData::Si32(v) => Ok((&v[..], dims.as_slice())),
                    _ => Err(mismatch()),
                })
                .collect::<HostResult<Vec<_>>>()?;
            wrap(kernels::concat(&parts, axis)?, TensorData::Si32)
        }
        Some(TensorData::Bool(_)) => {
            let parts = tensors
                .iter()
                .zip(&dims)
                .map(|(tensor, dims)| match &tensor.data {
                    TensorData::Bool(v) => Ok((&v[..], dims.as_slice())),
                    _ => Err(mismatch()),
                })
                .collect::<HostResult<Vec<_>>>()?;
            wrap(kernels::concat(&parts, axis)?, TensorData::Bool)
        }
        None => return Err(HostError::execution("concat needs at least one operand")),
    };
    CpuTensor::new(&out_dims, data)
}

fn wrap<T>(result: (Vec<T>, Vec<usize>), variant: fn(Arc<[T]>) -> TensorData) -> (TensorData, Vec<usize>) {
    (variant(Arc::from(result.0)), result.1)
}

fn static_dims(shape: &Shape) -> HostResult<Vec<usize>> {
    shape.static_dims().ok_or_else(|| {
        HostError::execution(format!("dynamic shape {shape} cannot be materialized"))
    })
}

fn axis_of(axis: isize, rank: usize) -> HostResult<usize> {
    normalize_axis(axis, rank)
        .ok_or_else(|| HostError::execution(format!("axis {axis} out of range for rank {rank}")))
}

fn expect_arity(node: &Node, inputs: &[CpuTensor], expected: usize) -> HostResult<()> {
    if inputs.len() == expected {
        Ok(())
    } else {
        Err(HostError::execution(format!(
            "{} expects {expected} operands, got {}",
            node.kind(),
            inputs.len()
        )))
    }
}

fn execute_operation(node: &Node, inputs: &[CpuTensor]) -> HostResult<Vec<CpuTensor>> {
    match &node.op {
        Operation::Custom(spec) => {
            return Err(HostError::unimplemented(
                format!("custom:{}", spec.target),
                "no kernel interceptor handles this target",
            ))
        }
        Operation::EngineCall(_) => {
            return Err(HostError::unimplemented(
                "engine_call",
                "engine calls run on the engine runtime",
            ))
        }
        _ => {}
    }

    // Concrete result specs from the concrete operand specs.
    let specs = inputs.iter().map(|tensor| &tensor.spec).collect::<Vec<_>>();
    let resolved = infer_node(node, &specs)
        .map_err(|message| HostError::execution(format!("{}: {message}", node.kind())))?;
    let out_dims = |index: usize| -> HostResult<Vec<usize>> {
        resolved
            .get(index)
            .ok_or_else(|| HostError::execution("missing result spec"))
            .and_then(|spec| static_dims(&spec.shape))
    };

    let result = match &node.op {
        Operation::Constant(literal) => literal_to_tensor(literal)?,
        Operation::Unary(op) => unary(&inputs[0], *op)?,
        Operation::Binary(op) => binary(&inputs[0], &inputs[1], *op)?,
        Operation::Clamp(spec) => {
            let input = &inputs[0];
            let lo = spec.min.unwrap_or(f64::NEG_INFINITY);
            let hi = spec.max.unwrap_or(f64::INFINITY);
            let data = match &input.data {
                TensorData::F32(v) => {
                    let (lo, hi) = (lo as f32, hi as f32);
                    TensorData::F32(v.iter().map(|&x| x.max(lo).min(hi)).collect())
                }
                TensorData::Si32(v) => TensorData::Si32(
                    v.iter()
                        .map(|&x| (f64::from(x).max(lo).min(hi)) as i32)
                        .collect(),
                ),
                TensorData::Si64(v) => TensorData::Si64(
                    v.iter()
                        .map(|&x| (x as f64).max(lo).min(hi) as i64)
                        .collect(),
                ),
                TensorData::Bool(_) => {
                    return Err(HostError::execution("clamp does not accept booleans"))
                }
            };
            CpuTensor::new(&input.dims()?, data)?
        }
        Operation::LeakyRelu(spec) => {
            let input = &inputs[0];
            let slope = spec.negative_slope as f32;
            let values = input
                .f32s("leaky_relu")?
                .iter()
                .map(|&x| if x >= 0.0 { x } else { x * slope })
                .collect();
            CpuTensor::from_f32(&input.dims()?, values)?
        }
        Operation::MatMul => {
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            let (values, dims) = kernels::matmul_promoted(
                lhs.f32s("matmul")?,
                &lhs.dims()?,
                rhs.f32s("matmul")?,
                &rhs.dims()?,
                false,
                false,
            )?;
            CpuTensor::from_f32(&dims, values)?
        }
        Operation::Linear(spec) => {
            expect_arity(node, inputs, if spec.has_bias { 3 } else { 2 })?;
            let (input, weight) = (&inputs[0], &inputs[1]);
            let mut dims = input.dims()?;
            if dims.len() == 1 {
                dims.insert(0, 1);
            }
            let (mut values, mm_dims) = kernels::matmul(
                input.f32s("linear")?,
                &dims,
                weight.f32s("linear")?,
                &weight.dims()?,
                false,
                true,
            )?;
            if spec.has_bias {
                let bias = &inputs[2];
                values = kernels::broadcast_zip(
                    &values,
                    &mm_dims,
                    bias.f32s("linear bias")?,
                    &bias.dims()?,
                    |a, b| a + b,
                )?
                .0;
            }
            CpuTensor::from_f32(&out_dims(0)?, values)?
        }
        Operation::Conv2d(spec) => {
            expect_arity(node, inputs, if spec.has_bias { 3 } else { 2 })?;
            let (input, weight) = (&inputs[0], &inputs[1]);
            let bias = if spec.has_bias {
                Some(inputs[2].f32s("conv2d bias")?)
            } else {
                None
            };
            let (values, dims) = kernels::conv2d(
                input.f32s("conv2d")?,
                &input.dims()?,
                weight.f32s("conv2d")?,
                &weight.dims()?,
                bias,
                Conv2dParams {
                    stride: spec.stride,
                    padding: spec.padding,
                    dilation: spec.dilation,
                    groups: spec.groups,
                },
            )?;
            CpuTensor::from_f32(&dims, values)?
        }
        Operation::MaxPool2d(spec) | Operation::AvgPool2d(spec) => {
            let mode = match &node.op {
                Operation::MaxPool2d(_) => PoolMode::Max,
                _ => PoolMode::Average {
                    count_include_pad: spec.count_include_pad,
                },
            };
            let input = &inputs[0];
            let (values, dims) = kernels::pool2d(
                input.f32s("pool2d")?,
                &input.dims()?,
                mode,
                spec.kernel,
                spec.stride,
                spec.padding,
            )?;
            CpuTensor::from_f32(&dims, values)?
        }
        Operation::AdaptiveAvgPool2d(spec) => {
            let input = &inputs[0];
            let (values, dims) =
                kernels::adaptive_avg_pool2d(input.f32s("adaptive_avg_pool2d")?, &input.dims()?, spec.output_size)?;
            CpuTensor::from_f32(&dims, values)?
        }
        Operation::BatchNorm(spec) => {
            expect_arity(node, inputs, 5)?;
            let input = &inputs[0];
            let (scale, shift) = kernels::fold_batch_norm(
                inputs[1].f32s("batch norm gamma")?,
                inputs[2].f32s("batch norm beta")?,
                inputs[3].f32s("batch norm mean")?,
                inputs[4].f32s("batch norm variance")?,
                spec.eps as f32,
            );
            let values = kernels::scale_channels(input.f32s("batch_norm")?, &input.dims()?, &scale, &shift)?;
            CpuTensor::from_f32(&input.dims()?, values)?
        }
        Operation::Softmax(spec) => {
            let input = &inputs[0];
            let dims = input.dims()?;
            let axis = axis_of(spec.axis, dims.len())?;
            CpuTensor::from_f32(&dims, kernels::softmax(input.f32s("softmax")?, &dims, axis)?)?
        }
        Operation::Reduce(spec) => {
            let input = &inputs[0];
            let dims = input.dims()?;
            let mut axes = spec
                .axes
                .iter()
                .map(|&axis| axis_of(axis, dims.len()))
                .collect::<HostResult<Vec<_>>>()?;
            axes.sort_unstable();
            axes.dedup();
            if axes.is_empty() {
                axes = (0..dims.len()).collect();
            }
            reduce(input, &dims, spec.kind, &axes, spec.keepdims)?
        }
        Operation::ArgMax(spec) => {
            let input = &inputs[0];
            let dims = input.dims()?;
            let axis = axis_of(spec.axis, dims.len())?;
            let (values, out) = match &input.data {
                TensorData::F32(v) => kernels::argmax(v, &dims, axis, spec.keepdims)?,
                TensorData::Si32(v) => kernels::argmax(v, &dims, axis, spec.keepdims)?,
                TensorData::Si64(v) => kernels::argmax(v, &dims, axis, spec.keepdims)?,
                TensorData::Bool(v) => kernels::argmax(v, &dims, axis, spec.keepdims)?,
            };
            CpuTensor::from_i64(&out, values)?
        }
        Operation::TopK(spec) => {
            let input = &inputs[0];
            let dims = input.dims()?;
            let axis = axis_of(spec.axis, dims.len())?;
            let (values, indices, out) = match &input.data {
                TensorData::F32(v) => {
                    let (values, indices, out) = kernels::topk(v, &dims, spec.k, axis, spec.largest)?;
                    (TensorData::F32(Arc::from(values)), indices, out)
                }
                TensorData::Si32(v) => {
                    let (values, indices, out) = kernels::topk(v, &dims, spec.k, axis, spec.largest)?;
                    (TensorData::Si32(Arc::from(values)), indices, out)
                }
                TensorData::Si64(v) => {
                    let (values, indices, out) = kernels::topk(v, &dims, spec.k, axis, spec.largest)?;
                    (TensorData::Si64(Arc::from(values)), indices, out)
                }
                TensorData::Bool(_) => return Err(HostError::execution("topk does not accept booleans")),
            };
            return Ok(vec![
                CpuTensor::new(&out, values)?,
                CpuTensor::from_i64(&out, indices)?,
            ]);
        }
        Operation::CumSum(spec) => {
            let input = &inputs[0];
            let dims = input.dims()?;
            let axis = axis_of(spec.axis, dims.len())?;
            let data = match &input.data {
                TensorData::F32(v) => TensorData::F32(Arc::from(kernels::cumsum(v, &dims, axis)?)),
                TensorData::Si32(v) => TensorData::Si32(Arc::from(kernels::cumsum(v, &dims, axis)?)),
                TensorData::Si64(v) => TensorData::Si64(Arc::from(kernels::cumsum(v, &dims, axis)?)),
                TensorData::Bool(_) => return Err(HostError::execution("cumsum does not accept booleans")),
            };
            CpuTensor::new(&dims, data)?
        }
        Operation::Reshape(_)
        | Operation::Flatten(_)
        | Operation::Squeeze(_)
        | Operation::Unsqueeze(_)
        | Operation::Identity
        | Operation::Dropout(_)
        | Operation::PlaceholderConst => reshape(&inputs[0], &out_dims(0)?)?,
        Operation::Transpose(spec) => transpose(&inputs[0], &spec.perm)?,
        Operation::Concat(spec) => {
            let rank = inputs.first().map(|tensor| tensor.spec.rank()).unwrap_or_default();
            let axis = axis_of(spec.axis, rank)?;
            concat(&inputs.iter().collect::<Vec<_>>(), axis)?
        }
        Operation::Slice(spec) => {
            let input = &inputs[0];
            let dims = input.dims()?;
            let axis = axis_of(spec.axis, dims.len())?;
            let (values, out) = match &input.data {
                TensorData::F32(v) => wrap(kernels::slice(v, &dims, axis, spec.start, spec.end, spec.step)?, TensorData::F32),
                TensorData::Si32(v) => wrap(kernels::slice(v, &dims, axis, spec.start, spec.end, spec.step)?, TensorData::Si32),
                TensorData::Si64(v) => wrap(kernels::slice(v, &dims, axis, spec.start, spec.end, spec.step)?, TensorData::Si64),
                TensorData::Bool(v) => wrap(kernels::slice(v, &dims, axis, spec.start, spec.end, spec.step)?, TensorData::Bool),
            };
            CpuTensor::new(&out, values)?
        }
        Operation::Cast(spec) => cast(&inputs[0], spec.dtype)?,
        Operation::Custom(_) | Operation::EngineCall(_) => {
            return Err(HostError::execution("unreachable host operation"))
        }
    };
    Ok(vec![result])
}

fn unary(input: &CpuTensor, op: UnaryOp) -> HostResult<CpuTensor> {
    let int = |x: i64| match op {
        UnaryOp::Relu => Ok(x.max(0)),
        UnaryOp::Neg => Ok(x.wrapping_neg()),
        UnaryOp::Abs => Ok(x.wrapping_abs()),
        other => Err(HostError::execution(format!("{other:?} needs a float operand"))),
    };
    let data = match &input.data {
        TensorData::F32(v) => TensorData::F32(v.iter().map(|&x| kernels::unary_f32(op, x)).collect()),
        TensorData::Si32(v) => TensorData::Si32(
            v.iter()
                .map(|&x| int(i64::from(x)).map(|y| y as i32))
                .collect::<HostResult<Vec<_>>>()?
                .into(),
        ),
        TensorData::Si64(v) => TensorData::Si64(
            v.iter()
                .map(|&x| int(x))
                .collect::<HostResult<Vec<_>>>()?
                .into(),
        ),
        TensorData::Bool(_) => return Err(HostError::execution("unary ops do not accept booleans")),
    };
    CpuTensor::new(&input.dims()?, data)
}

fn binary(lhs: &CpuTensor, rhs: &CpuTensor, op: BinaryOp) -> HostResult<CpuTensor> {
    let (lhs_dims, rhs_dims) = (lhs.dims()?, rhs.dims()?);
    let (data, dims) = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => wrap(
            kernels::broadcast_zip(a, &lhs_dims, b, &rhs_dims, |x, y| kernels::binary_f32(op, x, y))?,
            TensorData::F32,
        ),
        (TensorData::Si64(a), TensorData::Si64(b)) => {
            reject_zero_divisor(op, b.iter().any(|&v| v == 0))?;
            wrap(
                kernels::broadcast_zip(a, &lhs_dims, b, &rhs_dims, |x, y| kernels::binary_i64(op, x, y))?,
                TensorData::Si64,
            )
        }
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            reject_zero_divisor(op, b.iter().any(|&v| v == 0))?;
            wrap(
                kernels::broadcast_zip(a, &lhs_dims, b, &rhs_dims, |x, y| {
                    kernels::binary_i64(op, i64::from(x), i64::from(y)) as i32
                })?,
                TensorData::Si32,
            )
        }
        _ => {
            return Err(HostError::execution(format!(
                "binary {op:?} does not accept {} and {}",
                lhs.spec.dtype, rhs.spec.dtype
            )))
        }
    };
    CpuTensor::new(&dims, data)
}

fn reject_zero_divisor(op: BinaryOp, has_zero: bool) -> HostResult<()> {
    if op == BinaryOp::Div && has_zero {
        Err(HostError::execution("integer division by zero"))
    } else {
        Ok(())
    }
}

fn reduce(input: &CpuTensor, dims: &[usize], kind: ReduceKind, axes: &[usize], keepdims: bool) -> HostResult<CpuTensor> {
    let (data, out) = match &input.data {
        TensorData::F32(v) => {
            let reduced = match kind {
                ReduceKind::Sum => kernels::reduce_sum(v, dims, axes, keepdims)?,
                ReduceKind::Mean => kernels::reduce_mean(v, dims, axes, keepdims)?,
                ReduceKind::Max => kernels::reduce_max(v, dims, axes, keepdims)?,
                ReduceKind::Min => kernels::reduce_min(v, dims, axes, keepdims)?,
            };
            wrap(reduced, TensorData::F32)
        }
        TensorData::Si64(v) => {
            let reduced = match kind {
                ReduceKind::Sum => kernels::reduce_with(v, dims, axes, keepdims, 0, i64::wrapping_add)?,
                ReduceKind::Max => kernels::reduce_with(v, dims, axes, keepdims, i64::MIN, i64::max)?,
                ReduceKind::Min => kernels::reduce_with(v, dims, axes, keepdims, i64::MAX, i64::min)?,
                ReduceKind::Mean => return Err(HostError::execution("mean needs a float operand")),
            };
            wrap(reduced, TensorData::Si64)
        }
        TensorData::Si32(v) => {
            let reduced = match kind {
                ReduceKind::Sum => kernels::reduce_with(v, dims, axes, keepdims, 0, i32::wrapping_add)?,
                ReduceKind::Max => kernels::reduce_with(v, dims, axes, keepdims, i32::MIN, i32::max)?,
                ReduceKind::Min => kernels::reduce_with(v, dims, axes, keepdims, i32::MAX, i32::min)?,
                ReduceKind::Mean => return Err(HostError::execution("mean needs a float operand")),
            };
            wrap(reduced, TensorData::Si32)
        }
        TensorData::Bool(_) => return Err(HostError::execution("reduce does not accept booleans")),
    };
    CpuTensor::new(&out, data)
}
