//! Layer interpreter behind the reference execution context.

use anyhow::{anyhow, bail, ensure, Context, Result};
use half::f16;
use tracing::trace;

use hylo::engine::{
    ActivationKind, DeviceBuffer, ElementWiseOp, Layer, LayerKind, LayerReduceOp, PoolingKind,
    PrecisionMode, UnaryKind,
};
use hylo::graph::{BinaryOp, UnaryOp};
use hylo_backend_ref_cpu::cpu::{self, CpuTensor, TensorData};
use hylo_backend_ref_cpu::kernels::{self, Conv2dParams, PoolMode};

use crate::plan::{is_float_layer, EnginePlan};

/// Runs every layer of `plan` over `inputs` and returns the marked outputs.
pub fn execute_plan(plan: &EnginePlan, inputs: &[DeviceBuffer]) -> Result<Vec<DeviceBuffer>> {
    let network = &plan.network;
    ensure!(
        inputs.len() == network.inputs().len(),
        "engine expects {} inputs, got {}",
        network.inputs().len(),
        inputs.len()
    );

    let mut tensors: Vec<Option<CpuTensor>> = vec![None; network.tensor_count()];
    for (binding, buffer) in network.inputs().iter().zip(inputs) {
        let spec = network.tensor_spec(binding.tensor)?;
        ensure!(
            spec.dtype == buffer.dtype && spec.shape.admits(&buffer.dims),
            "input '{}' is {}, expected {spec}",
            binding.name,
            buffer.spec()
        );
        let tensor = cpu::literal_to_tensor(&buffer.to_literal()).map_err(|err| anyhow!(err))?;
        tensors[binding.tensor.0 as usize] = Some(tensor);
    }

    for layer in network.layers() {
        let operands = layer
            .inputs
            .iter()
            .map(|tensor| {
                tensors
                    .get(tensor.0 as usize)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| anyhow!("layer '{}' reads unset tensor {tensor}", layer.name))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut results =
            run_layer(layer, &operands).with_context(|| format!("layer '{}' ({})", layer.name, layer.kind.name()))?;
        ensure!(
            results.len() == layer.outputs.len(),
            "layer '{}' produced {} tensors for {} outputs",
            layer.name,
            results.len(),
            layer.outputs.len()
        );
        if layer.precision == PrecisionMode::Reduced && is_float_layer(&layer.kind) {
            results = results.into_iter().map(round_to_half).collect();
        }
        for (tensor, value) in layer.outputs.iter().zip(results) {
            tensors[tensor.0 as usize] = Some(value);
        }
        trace!(layer = %layer.name, "executed layer");
    }

    network
        .outputs()
        .iter()
        .map(|binding| {
            let tensor = tensors
                .get(binding.tensor.0 as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| anyhow!("output '{}' was never produced", binding.name))?;
            DeviceBuffer::from_literal(&cpu::tensor_to_literal(tensor)).map_err(|err| anyhow!(err))
        })
        .collect()
}

/// Half-precision kernels keep f32 storage but only f16 resolution.
fn round_to_half(tensor: CpuTensor) -> CpuTensor {
    let TensorData::F32(values) = &tensor.data else {
        return tensor;
    };
    let data = TensorData::F32(values.iter().map(|&v| f16::from_f32(v).to_f32()).collect());
    CpuTensor {
        spec: tensor.spec,
        data,
    }
}

fn f32_operand<'a>(tensor: &'a CpuTensor, layer: &str) -> Result<&'a [f32]> {
    tensor
        .as_f32()
        .ok_or_else(|| anyhow!("{layer} needs f32 data, got {}", tensor.spec.dtype))
}

fn host<T>(result: hylo::runtime::HostResult<T>) -> Result<T> {
    result.map_err(|err| anyhow!(err))
}

fn run_layer(layer: &Layer, inputs: &[&CpuTensor]) -> Result<Vec<CpuTensor>> {
    let arity = |expected: usize| -> Result<()> {
        ensure!(
            inputs.len() == expected,
            "expected {expected} inputs, got {}",
            inputs.len()
        );
        Ok(())
    };
    let single = |tensor: CpuTensor| -> Result<Vec<CpuTensor>> { Ok(vec![tensor]) };

    match &layer.kind {
        LayerKind::Constant { weights } => {
            arity(0)?;
            single(host(cpu::literal_to_tensor(weights))?)
        }
        LayerKind::Identity => {
            arity(1)?;
            single(inputs[0].clone())
        }
        LayerKind::Cast { dtype } => {
            arity(1)?;
            single(host(cpu::cast(inputs[0], *dtype))?)
        }
        LayerKind::Activation(kind) => {
            arity(1)?;
            let input = inputs[0];
            let values = f32_operand(input, "activation")?;
            let out = match *kind {
                ActivationKind::Relu => map_f32(values, |x| kernels::unary_f32(UnaryOp::Relu, x)),
                ActivationKind::Sigmoid => map_f32(values, |x| kernels::unary_f32(UnaryOp::Sigmoid, x)),
                ActivationKind::Tanh => map_f32(values, |x| kernels::unary_f32(UnaryOp::Tanh, x)),
                ActivationKind::LeakyRelu { alpha } => {
                    map_f32(values, |x| if x >= 0.0 { x } else { x * alpha })
                }
                ActivationKind::Clip { min, max } => map_f32(values, |x| x.max(min).min(max)),
            };
            single(host(CpuTensor::from_f32(&host(input.dims())?, out))?)
        }
        LayerKind::Unary(kind) => {
            arity(1)?;
            let input = inputs[0];
            let op = match kind {
                UnaryKind::Exp => UnaryOp::Exp,
                UnaryKind::Log => UnaryOp::Log,
                UnaryKind::Neg => UnaryOp::Neg,
                UnaryKind::Abs => UnaryOp::Abs,
                UnaryKind::Sqrt => UnaryOp::Sqrt,
            };
            let out = map_f32(f32_operand(input, "unary")?, |x| kernels::unary_f32(op, x));
            single(host(CpuTensor::from_f32(&host(input.dims())?, out))?)
        }
        LayerKind::ElementWise(op) => {
            arity(2)?;
            let (lhs, rhs) = (inputs[0], inputs[1]);
            ensure!(
                lhs.spec.rank() == rhs.spec.rank(),
                "elementwise operands must share a rank, got {} and {}",
                lhs.spec,
                rhs.spec
            );
            single(elementwise(*op, lhs, rhs)?)
        }
        LayerKind::MatrixMultiply {
            transpose_a,
            transpose_b,
        } => {
            arity(2)?;
            single(matrix_multiply(inputs[0], inputs[1], *transpose_a, *transpose_b)?)
        }
        LayerKind::Convolution {
            kernel,
            bias,
            stride,
            padding,
            dilation,
            groups,
        } => {
            arity(1)?;
            let input = inputs[0];
            let weight = host(cpu::literal_to_tensor(kernel))?;
            let bias = bias
                .as_ref()
                .map(|literal| host(cpu::literal_to_tensor(literal)))
                .transpose()?;
            let bias_values = bias.as_ref().map(|b| f32_operand(b, "convolution bias")).transpose()?;
            let (values, dims) = host(kernels::conv2d(
                f32_operand(input, "convolution")?,
                &host(input.dims())?,
                f32_operand(&weight, "convolution kernel")?,
                &host(weight.dims())?,
                bias_values,
                Conv2dParams {
                    stride: *stride,
                    padding: *padding,
                    dilation: *dilation,
                    groups: *groups,
                },
            ))?;
            single(host(CpuTensor::from_f32(&dims, values))?)
        }
        LayerKind::Pooling {
            kind,
            window,
            stride,
            padding,
            count_include_pad,
        } => {
            arity(1)?;
            let input = inputs[0];
            let mode = match kind {
                PoolingKind::Max => PoolMode::Max,
                PoolingKind::Average => PoolMode::Average {
                    count_include_pad: *count_include_pad,
                },
            };
            let (values, dims) = host(kernels::pool2d(
                f32_operand(input, "pooling")?,
                &host(input.dims())?,
                mode,
                *window,
                *stride,
                *padding,
            ))?;
            single(host(CpuTensor::from_f32(&dims, values))?)
        }
        LayerKind::Scale { scale, shift } => {
            arity(1)?;
            let input = inputs[0];
            let dims = host(input.dims())?;
            let values = host(kernels::scale_channels(f32_operand(input, "scale")?, &dims, scale, shift))?;
            single(host(CpuTensor::from_f32(&dims, values))?)
        }
        LayerKind::SoftMax { axis } => {
            arity(1)?;
            let input = inputs[0];
            let dims = host(input.dims())?;
            let values = host(kernels::softmax(f32_operand(input, "softmax")?, &dims, *axis))?;
            single(host(CpuTensor::from_f32(&dims, values))?)
        }
        LayerKind::Reduce { op, axes, keep_dims } => {
            arity(1)?;
            single(reduce(inputs[0], *op, axes, *keep_dims)?)
        }
        LayerKind::Shuffle {
            first_transpose,
            reshape,
        } => {
            arity(1)?;
            let mut tensor = inputs[0].clone();
            if let Some(perm) = first_transpose {
                tensor = host(cpu::transpose(&tensor, perm))?;
            }
            if let Some(dims) = reshape {
                tensor = host(cpu::reshape(&tensor, dims))?;
            }
            single(tensor)
        }
        LayerKind::Concatenation { axis } => {
            ensure!(!inputs.is_empty(), "concatenation needs inputs");
            single(host(cpu::concat(inputs, *axis))?)
        }
        LayerKind::Slice {
            axis,
            start,
            size,
            stride,
        } => {
            arity(1)?;
            single(host(cpu::slice_range(inputs[0], *axis, *start, *size, *stride))?)
        }
    }
}

fn map_f32(values: &[f32], f: impl Fn(f32) -> f32) -> Vec<f32> {
    values.iter().map(|&x| f(x)).collect()
}

fn binary_op(op: ElementWiseOp) -> BinaryOp {
    match op {
        ElementWiseOp::Sum => BinaryOp::Add,
        ElementWiseOp::Sub => BinaryOp::Sub,
        ElementWiseOp::Prod => BinaryOp::Mul,
        ElementWiseOp::Div => BinaryOp::Div,
        ElementWiseOp::Max => BinaryOp::Maximum,
        ElementWiseOp::Min => BinaryOp::Minimum,
        ElementWiseOp::Pow => BinaryOp::Pow,
    }
}

fn elementwise(op: ElementWiseOp, lhs: &CpuTensor, rhs: &CpuTensor) -> Result<CpuTensor> {
    let op = binary_op(op);
    let (lhs_dims, rhs_dims) = (host(lhs.dims())?, host(rhs.dims())?);
    match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let (values, dims) = host(kernels::broadcast_zip(a, &lhs_dims, b, &rhs_dims, |x, y| {
                kernels::binary_f32(op, x, y)
            }))?;
            host(CpuTensor::from_f32(&dims, values))
        }
        (TensorData::Si64(a), TensorData::Si64(b)) => {
            if op == BinaryOp::Div && b.iter().any(|&v| v == 0) {
                bail!("integer division by zero");
            }
            let (values, dims) = host(kernels::broadcast_zip(a, &lhs_dims, b, &rhs_dims, |x, y| {
                kernels::binary_i64(op, x, y)
            }))?;
            host(CpuTensor::from_i64(&dims, values))
        }
        _ => bail!(
            "elementwise operands {} and {} are not supported",
            lhs.spec,
            rhs.spec
        ),
    }
}

fn matrix_multiply(lhs: &CpuTensor, rhs: &CpuTensor, transpose_a: bool, transpose_b: bool) -> Result<CpuTensor> {
    let (values, dims) = host(kernels::matmul_promoted(
        f32_operand(lhs, "matrix multiply")?,
        &host(lhs.dims())?,
        f32_operand(rhs, "matrix multiply")?,
        &host(rhs.dims())?,
        transpose_a,
        transpose_b,
    ))?;
    host(CpuTensor::from_f32(&dims, values))
}

fn reduce(input: &CpuTensor, op: LayerReduceOp, axes: &[usize], keep_dims: bool) -> Result<CpuTensor> {
    let dims = host(input.dims())?;
    match &input.data {
        TensorData::F32(values) => {
            let (out, out_dims) = host(match op {
                LayerReduceOp::Sum => kernels::reduce_sum(values, &dims, axes, keep_dims),
                LayerReduceOp::Mean => kernels::reduce_mean(values, &dims, axes, keep_dims),
                LayerReduceOp::Max => kernels::reduce_max(values, &dims, axes, keep_dims),
                LayerReduceOp::Min => kernels::reduce_min(values, &dims, axes, keep_dims),
            })?;
            host(CpuTensor::from_f32(&out_dims, out))
        }
        TensorData::Si64(values) => {
            let (out, out_dims) = host(match op {
                LayerReduceOp::Sum => kernels::reduce_with(values, &dims, axes, keep_dims, 0, i64::wrapping_add),
                LayerReduceOp::Max => kernels::reduce_with(values, &dims, axes, keep_dims, i64::MIN, i64::max),
                LayerReduceOp::Min => kernels::reduce_with(values, &dims, axes, keep_dims, i64::MAX, i64::min),
                LayerReduceOp::Mean => bail!("mean reduction needs f32 data"),
            })?;
            host(CpuTensor::from_i64(&out_dims, out))
        }
        _ => bail!("reduce does not support {}", input.spec.dtype),
    }
}
