//! Forward shape and dtype propagation over a topologically ordered graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ShapeInferenceError;
use crate::graph::{
    BinaryOp, Conv2dSpec, DType, Dimension, Graph, Node, Operation, Pool2dSpec, ReduceKind,
    ReshapeDim, Shape, TensorSpec, ValueId,
};
use crate::shape::{
    broadcast_shapes, derived_symbol, normalize_axis, normalize_insert_axis, slice_len,
    window_output_extent,
};

/// Resolved type of every value in a graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueTypes {
    entries: BTreeMap<ValueId, TensorSpec>,
}

impl ValueTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, value: ValueId) -> Option<&TensorSpec> {
        self.entries.get(&value)
    }

    pub fn insert(&mut self, value: ValueId, spec: TensorSpec) {
        self.entries.insert(value, spec);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &TensorSpec)> {
        self.entries.iter().map(|(value, spec)| (*value, spec))
    }

    /// Keeps only the values `keep` accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(ValueId) -> bool) {
        self.entries.retain(|value, _| keep(*value));
    }
}

impl Serialize for ValueTypes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.entries.iter())
    }
}

impl<'de> Deserialize<'de> for ValueTypes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let pairs = Vec::<(ValueId, TensorSpec)>::deserialize(deserializer)?;
        Ok(ValueTypes {
            entries: pairs.into_iter().collect(),
        })
    }
}

/// Annotates every value with a spec, starting from the supplied input specs.
pub fn propagate(graph: &Graph, input_specs: &[TensorSpec]) -> Result<ValueTypes, ShapeInferenceError> {
    if graph.inputs.len() != input_specs.len() {
        return Err(ShapeInferenceError {
            node: None,
            value: None,
            message: format!(
                "graph declares {} inputs but {} input specs were supplied",
                graph.inputs.len(),
                input_specs.len()
            ),
        });
    }

    let mut types = ValueTypes::new();
    for (input, spec) in graph.inputs.iter().zip(input_specs) {
        if let Some(dtype) = input.dtype {
            if dtype != spec.dtype {
                return Err(ShapeInferenceError::at_value(
                    input.value,
                    format!("input '{}' is traced as {dtype} but configured as {}", input.name, spec.dtype),
                ));
            }
        }
        if let Some(shape) = &input.shape {
            if shape.rank() != spec.rank() {
                return Err(ShapeInferenceError::at_value(
                    input.value,
                    format!(
                        "input '{}' is traced with rank {} but configured with rank {}",
                        input.name,
                        shape.rank(),
                        spec.rank()
                    ),
                ));
            }
            for (axis, (traced, configured)) in shape.dims().iter().zip(spec.shape.dims()).enumerate() {
                if let (Some(traced), Some(configured)) = (traced.as_static(), configured.as_static()) {
                    if traced != configured {
                        return Err(ShapeInferenceError::at_value(
                            input.value,
                            format!(
                                "input '{}' is traced with extent {traced} on axis {axis} but configured with {configured}",
                                input.name
                            ),
                        ));
                    }
                }
            }
        }
        types.insert(input.value, spec.clone());
    }

    for node in &graph.nodes {
        let mut operands = Vec::with_capacity(node.inputs.len());
        for value in &node.inputs {
            let spec = types.get(*value).ok_or_else(|| {
                ShapeInferenceError::at_node(node.id, format!("operand {value} has no known type"))
            })?;
            operands.push(spec);
        }
        let outputs = infer_node(node, &operands)
            .map_err(|message| ShapeInferenceError::at_node(node.id, message))?;
        if outputs.len() != node.outputs.len() {
            return Err(ShapeInferenceError::at_node(
                node.id,
                format!(
                    "{} produces {} results but the node declares {}",
                    node.kind(),
                    outputs.len(),
                    node.outputs.len()
                ),
            ));
        }
        for (value, spec) in node.outputs.iter().zip(outputs) {
            types.insert(*value, spec);
        }
    }

    debug!(graph = %graph.name, values = types.len(), "propagated value types");
    Ok(types)
}

/// Result specs of one node given its operand specs.
pub fn infer_node(node: &Node, inputs: &[&TensorSpec]) -> Result<Vec<TensorSpec>, String> {
    let single = |spec: TensorSpec| Ok(vec![spec]);
    match &node.op {
        Operation::Constant(literal) => {
            expect_arity(inputs, 0)?;
            if !literal.is_consistent() {
                return Err(format!(
                    "constant payload of {} bytes does not match {}",
                    literal.byte_len(),
                    literal.spec
                ));
            }
            single(literal.spec.clone())
        }
        Operation::Unary(op) => {
            expect_arity(inputs, 1)?;
            if op.requires_float() {
                expect_float(inputs[0])?;
            } else {
                expect_numeric(inputs[0])?;
            }
            single(inputs[0].clone())
        }
        Operation::Binary(op) => {
            expect_arity(inputs, 2)?;
            let (lhs, rhs) = (inputs[0], inputs[1]);
            if lhs.dtype != rhs.dtype {
                return Err(format!("operand dtypes differ: {} vs {}", lhs.dtype, rhs.dtype));
            }
            if *op == BinaryOp::Pow {
                expect_float(lhs)?;
            } else {
                expect_numeric(lhs)?;
            }
            let dims = broadcast_shapes(lhs.shape.dims(), rhs.shape.dims())?;
            single(TensorSpec::new(lhs.dtype, Shape::new(dims)))
        }
        Operation::Clamp(spec) => {
            expect_arity(inputs, 1)?;
            expect_numeric(inputs[0])?;
            if let (Some(min), Some(max)) = (spec.min, spec.max) {
                if min > max {
                    return Err(format!("clamp bounds are inverted: {min} > {max}"));
                }
            }
            single(inputs[0].clone())
        }
        Operation::LeakyRelu(_) => {
            expect_arity(inputs, 1)?;
            expect_float(inputs[0])?;
            single(inputs[0].clone())
        }
        Operation::MatMul => {
            expect_arity(inputs, 2)?;
            single(infer_matmul(inputs[0], inputs[1])?)
        }
        Operation::Linear(spec) => {
            expect_arity(inputs, if spec.has_bias { 3 } else { 2 })?;
            infer_linear(inputs, spec.has_bias).map(|spec| vec![spec])
        }
        Operation::Conv2d(spec) => {
            expect_arity(inputs, if spec.has_bias { 3 } else { 2 })?;
            infer_conv2d(node, inputs, spec).map(|spec| vec![spec])
        }
        Operation::MaxPool2d(spec) | Operation::AvgPool2d(spec) => {
            expect_arity(inputs, 1)?;
            infer_pool2d(node, inputs[0], spec).map(|spec| vec![spec])
        }
        Operation::AdaptiveAvgPool2d(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            expect_float(input)?;
            expect_rank(input, 4)?;
            let mut dims = input.shape.dims().to_vec();
            dims[2] = Dimension::Static(spec.output_size[0]);
            dims[3] = Dimension::Static(spec.output_size[1]);
            if spec.output_size.contains(&0) {
                return Err("adaptive pool output size must be positive".to_string());
            }
            single(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Operation::BatchNorm(_) => {
            expect_arity(inputs, 5)?;
            let input = inputs[0];
            expect_float(input)?;
            if input.rank() < 2 {
                return Err(format!("batch norm expects rank >= 2, got {}", input.rank()));
            }
            let channels = &input.shape.dims()[1];
            for param in &inputs[1..] {
                expect_rank(param, 1)?;
                if let (Some(expected), Some(actual)) =
                    (channels.as_static(), param.shape.dims()[0].as_static())
                {
                    if expected != actual {
                        return Err(format!(
                            "batch norm parameter has {actual} channels, input has {expected}"
                        ));
                    }
                }
            }
            single(input.clone())
        }
        Operation::Softmax(spec) => {
            expect_arity(inputs, 1)?;
            expect_float(inputs[0])?;
            axis_of(spec.axis, inputs[0].rank())?;
            single(inputs[0].clone())
        }
        Operation::Reduce(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            if spec.kind == ReduceKind::Mean {
                expect_float(input)?;
            } else {
                expect_numeric(input)?;
            }
            let axes = resolve_axes(&spec.axes, input.rank())?;
            single(reduced_spec(input, &axes, spec.keepdims))
        }
        Operation::ArgMax(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            expect_numeric(input)?;
            let axis = axis_of(spec.axis, input.rank())?;
            let reduced = reduced_spec(input, &[axis], spec.keepdims);
            single(TensorSpec::new(DType::Si64, reduced.shape))
        }
        Operation::TopK(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            expect_numeric(input)?;
            let axis = axis_of(spec.axis, input.rank())?;
            if let Some(extent) = input.shape.dims()[axis].as_static() {
                if spec.k > extent {
                    return Err(format!("topk k={} exceeds axis extent {extent}", spec.k));
                }
            }
            let mut dims = input.shape.dims().to_vec();
            dims[axis] = Dimension::Static(spec.k);
            let shape = Shape::new(dims);
            Ok(vec![
                TensorSpec::new(input.dtype, shape.clone()),
                TensorSpec::new(DType::Si64, shape),
            ])
        }
        Operation::CumSum(spec) => {
            expect_arity(inputs, 1)?;
            expect_numeric(inputs[0])?;
            axis_of(spec.axis, inputs[0].rank())?;
            single(inputs[0].clone())
        }
        Operation::Reshape(spec) => {
            expect_arity(inputs, 1)?;
            infer_reshape(node, inputs[0], &spec.new_shape).map(|spec| vec![spec])
        }
        Operation::Flatten(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            let rank = input.rank().max(1);
            let start = axis_of(spec.start_axis, rank)?;
            let end = axis_of(spec.end_axis, rank)?;
            if start > end {
                return Err(format!("flatten start axis {start} is after end axis {end}"));
            }
            if input.rank() == 0 {
                return single(TensorSpec::new(input.dtype, Shape::from_static(&[1])));
            }
            let dims = input.shape.dims();
            let merged = dims[start..=end]
                .iter()
                .map(Dimension::as_static)
                .try_fold(1usize, |acc, dim| dim.map(|dim| acc * dim))
                .map(Dimension::Static)
                .unwrap_or_else(|| derived_symbol(node.id.0, start));
            let mut out = dims[..start].to_vec();
            out.push(merged);
            out.extend_from_slice(&dims[end + 1..]);
            single(TensorSpec::new(input.dtype, Shape::new(out)))
        }
        Operation::Transpose(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            let rank = input.rank();
            let mut seen = vec![false; rank];
            if spec.perm.len() != rank {
                return Err(format!("permutation {:?} does not cover rank {rank}", spec.perm));
            }
            for &axis in &spec.perm {
                if axis >= rank || std::mem::replace(&mut seen[axis], true) {
                    return Err(format!("{:?} is not a permutation", spec.perm));
                }
            }
            let dims = spec
                .perm
                .iter()
                .map(|&axis| input.shape.dims()[axis].clone())
                .collect::<Vec<_>>();
            single(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Operation::Squeeze(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            let axis = axis_of(spec.axis, input.rank())?;
            if let Some(extent) = input.shape.dims()[axis].as_static() {
                if extent != 1 {
                    return Err(format!("cannot squeeze axis {axis} of extent {extent}"));
                }
            }
            let mut dims = input.shape.dims().to_vec();
            dims.remove(axis);
            single(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Operation::Unsqueeze(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            let axis = normalize_insert_axis(spec.axis, input.rank())
                .ok_or_else(|| format!("axis {} out of range for rank {}", spec.axis, input.rank()))?;
            let mut dims = input.shape.dims().to_vec();
            dims.insert(axis, Dimension::Static(1));
            single(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Operation::Concat(spec) => {
            if inputs.is_empty() {
                return Err("concat needs at least one operand".to_string());
            }
            infer_concat(node, inputs, spec.axis).map(|spec| vec![spec])
        }
        Operation::Slice(spec) => {
            expect_arity(inputs, 1)?;
            let input = inputs[0];
            if spec.step == 0 {
                return Err("slice step must be positive".to_string());
            }
            let axis = axis_of(spec.axis, input.rank())?;
            let mut dims = input.shape.dims().to_vec();
            dims[axis] = match dims[axis].as_static() {
                Some(extent) => Dimension::Static(slice_len(spec.start, spec.end, spec.step, extent)),
                None => derived_symbol(node.id.0, axis),
            };
            single(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Operation::Cast(spec) => {
            expect_arity(inputs, 1)?;
            single(TensorSpec::new(spec.dtype, inputs[0].shape.clone()))
        }
        Operation::Dropout(spec) => {
            expect_arity(inputs, 1)?;
            if !(0.0..1.0).contains(&spec.p) {
                return Err(format!("dropout probability {} is outside [0, 1)", spec.p));
            }
            single(inputs[0].clone())
        }
        Operation::Identity | Operation::PlaceholderConst => {
            expect_arity(inputs, 1)?;
            single(inputs[0].clone())
        }
        Operation::Custom(spec) => Ok(spec.outputs.clone()),
        Operation::EngineCall(spec) => {
            let manifest = &spec.artifact.manifest;
            expect_arity(inputs, manifest.inputs.len())?;
            Ok(manifest
                .outputs
                .iter()
                .map(|binding| binding.spec.clone())
                .collect())
        }
    }
}

fn expect_arity(inputs: &[&TensorSpec], expected: usize) -> Result<(), String> {
    if inputs.len() == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} operands, got {}", inputs.len()))
    }
}

fn expect_float(spec: &TensorSpec) -> Result<(), String> {
    if spec.dtype.is_float() {
        Ok(())
    } else {
        Err(format!("expected a floating point operand, got {}", spec.dtype))
    }
}

fn expect_numeric(spec: &TensorSpec) -> Result<(), String> {
    if spec.dtype == DType::I1 {
        Err("boolean operands are not supported here".to_string())
    } else {
        Ok(())
    }
}

fn expect_rank(spec: &TensorSpec, rank: usize) -> Result<(), String> {
    if spec.rank() == rank {
        Ok(())
    } else {
        Err(format!("expected rank {rank}, got {}", spec.rank()))
    }
}

fn axis_of(axis: isize, rank: usize) -> Result<usize, String> {
    normalize_axis(axis, rank).ok_or_else(|| format!("axis {axis} out of range for rank {rank}"))
}

fn resolve_axes(axes: &[isize], rank: usize) -> Result<Vec<usize>, String> {
    let mut resolved = axes
        .iter()
        .map(|&axis| axis_of(axis, rank))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_unstable();
    let before = resolved.len();
    resolved.dedup();
    if resolved.len() != before {
        return Err(format!("reduction axes {axes:?} repeat an axis"));
    }
    if resolved.is_empty() {
        resolved = (0..rank).collect();
    }
    Ok(resolved)
}

fn reduced_spec(input: &TensorSpec, axes: &[usize], keepdims: bool) -> TensorSpec {
    let dims = input
        .shape
        .dims()
        .iter()
        .enumerate()
        .filter_map(|(axis, dim)| match (axes.contains(&axis), keepdims) {
            (false, _) => Some(dim.clone()),
            (true, true) => Some(Dimension::Static(1)),
            (true, false) => None,
        })
        .collect::<Vec<_>>();
    TensorSpec::new(input.dtype, Shape::new(dims))
}

fn check_extent(lhs: &Dimension, rhs: &Dimension, what: &str) -> Result<(), String> {
    match (lhs.as_static(), rhs.as_static()) {
        (Some(a), Some(b)) if a != b => Err(format!("{what} mismatch: {a} vs {b}")),
        _ => Ok(()),
    }
}

fn infer_matmul(lhs: &TensorSpec, rhs: &TensorSpec) -> Result<TensorSpec, String> {
    if lhs.dtype != rhs.dtype {
        return Err(format!("operand dtypes differ: {} vs {}", lhs.dtype, rhs.dtype));
    }
    expect_float(lhs)?;
    if lhs.rank() == 0 || rhs.rank() == 0 {
        return Err("matmul operands must have rank >= 1".to_string());
    }
    let mut l = lhs.shape.dims().to_vec();
    let mut r = rhs.shape.dims().to_vec();
    let lhs_vector = l.len() == 1;
    let rhs_vector = r.len() == 1;
    if lhs_vector {
        l.insert(0, Dimension::Static(1));
    }
    if rhs_vector {
        r.push(Dimension::Static(1));
    }
    check_extent(&l[l.len() - 1], &r[r.len() - 2], "contraction extent")?;
    let mut dims = broadcast_shapes(&l[..l.len() - 2], &r[..r.len() - 2])?;
    if !lhs_vector {
        dims.push(l[l.len() - 2].clone());
    }
    if !rhs_vector {
        dims.push(r[r.len() - 1].clone());
    }
    Ok(TensorSpec::new(lhs.dtype, Shape::new(dims)))
}

fn infer_linear(inputs: &[&TensorSpec], has_bias: bool) -> Result<TensorSpec, String> {
    let (input, weight) = (inputs[0], inputs[1]);
    expect_float(input)?;
    expect_rank(weight, 2)?;
    if input.rank() == 0 {
        return Err("linear input must have rank >= 1".to_string());
    }
    let dims = input.shape.dims();
    let w = weight.shape.dims();
    check_extent(&dims[dims.len() - 1], &w[1], "linear input features")?;
    if has_bias {
        let bias = inputs[2];
        expect_rank(bias, 1)?;
        check_extent(&bias.shape.dims()[0], &w[0], "linear bias features")?;
    }
    let mut out = dims[..dims.len() - 1].to_vec();
    out.push(w[0].clone());
    Ok(TensorSpec::new(input.dtype, Shape::new(out)))
}

fn spatial_extent(
    node: &Node,
    axis: usize,
    input: &Dimension,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Result<Dimension, String> {
    match input.as_static() {
        Some(extent) => window_output_extent(extent, kernel, stride, padding, dilation)
            .map(Dimension::Static)
            .ok_or_else(|| {
                format!("window of {kernel} (stride {stride}, padding {padding}) does not fit extent {extent}")
            }),
        None => Ok(derived_symbol(node.id.0, axis)),
    }
}

fn infer_conv2d(node: &Node, inputs: &[&TensorSpec], spec: &Conv2dSpec) -> Result<TensorSpec, String> {
    let (input, weight) = (inputs[0], inputs[1]);
    expect_float(input)?;
    expect_rank(input, 4)?;
    expect_rank(weight, 4)?;
    if spec.groups == 0 {
        return Err("conv groups must be positive".to_string());
    }
    let x = input.shape.dims();
    let w = weight.shape.dims().to_vec();
    let kernel = [
        w[2].as_static().ok_or("conv kernel extent must be static")?,
        w[3].as_static().ok_or("conv kernel extent must be static")?,
    ];
    if let (Some(channels), Some(per_group)) = (x[1].as_static(), w[1].as_static()) {
        if channels != per_group * spec.groups {
            return Err(format!(
                "input has {channels} channels but weight expects {per_group} x {} groups",
                spec.groups
            ));
        }
    }
    if let Some(out_channels) = w[0].as_static() {
        if out_channels % spec.groups != 0 {
            return Err(format!(
                "{out_channels} output channels are not divisible by {} groups",
                spec.groups
            ));
        }
    }
    if spec.has_bias {
        expect_rank(inputs[2], 1)?;
        check_extent(&inputs[2].shape.dims()[0], &w[0], "conv bias channels")?;
    }
    let mut dims = vec![x[0].clone(), w[0].clone()];
    for i in 0..2 {
        dims.push(spatial_extent(
            node,
            2 + i,
            &x[2 + i],
            kernel[i],
            spec.stride[i],
            spec.padding[i],
            spec.dilation[i],
        )?);
    }
    Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
}

fn infer_pool2d(node: &Node, input: &TensorSpec, spec: &Pool2dSpec) -> Result<TensorSpec, String> {
    expect_numeric(input)?;
    expect_rank(input, 4)?;
    for i in 0..2 {
        if spec.padding[i] * 2 > spec.kernel[i] {
            return Err(format!(
                "pool padding {} exceeds half the window {}",
                spec.padding[i], spec.kernel[i]
            ));
        }
    }
    let x = input.shape.dims();
    let mut dims = vec![x[0].clone(), x[1].clone()];
    for i in 0..2 {
        dims.push(spatial_extent(
            node,
            2 + i,
            &x[2 + i],
            spec.kernel[i],
            spec.stride[i],
            spec.padding[i],
            1,
        )?);
    }
    Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
}

fn infer_reshape(node: &Node, input: &TensorSpec, new_shape: &[ReshapeDim]) -> Result<TensorSpec, String> {
    let infer_count = new_shape
        .iter()
        .filter(|dim| matches!(dim, ReshapeDim::Infer))
        .count();
    if infer_count > 1 {
        return Err("reshape may infer at most one dimension".to_string());
    }
    let explicit = new_shape
        .iter()
        .filter_map(|dim| match dim {
            ReshapeDim::Explicit(value) => Some(*value),
            ReshapeDim::Infer => None,
        })
        .product::<usize>();

    let inferred = match input.element_count() {
        Some(total) => {
            if infer_count == 0 {
                if explicit != total {
                    return Err(format!("cannot reshape {} elements into {explicit}", total));
                }
                None
            } else if explicit == 0 || total % explicit != 0 {
                return Err(format!("cannot infer a dimension for {total} elements over {explicit}"));
            } else {
                Some(Dimension::Static(total / explicit))
            }
        }
        None => (infer_count == 1).then(|| {
            let axis = new_shape
                .iter()
                .position(|dim| matches!(dim, ReshapeDim::Infer))
                .unwrap_or(0);
            derived_symbol(node.id.0, axis)
        }),
    };

    let dims = new_shape
        .iter()
        .map(|dim| match dim {
            ReshapeDim::Explicit(value) => Dimension::Static(*value),
            ReshapeDim::Infer => inferred.clone().unwrap_or(Dimension::Static(1)),
        })
        .collect::<Vec<_>>();
    Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
}

fn infer_concat(node: &Node, inputs: &[&TensorSpec], axis: isize) -> Result<TensorSpec, String> {
    let first = inputs[0];
    let rank = first.rank();
    let axis = axis_of(axis, rank)?;
    let mut dims = first.shape.dims().to_vec();
    let mut total = dims[axis].as_static();
    for other in &inputs[1..] {
        if other.dtype != first.dtype {
            return Err(format!("concat dtypes differ: {} vs {}", first.dtype, other.dtype));
        }
        if other.rank() != rank {
            return Err(format!("concat ranks differ: {rank} vs {}", other.rank()));
        }
        for (i, (lhs, rhs)) in dims.iter().zip(other.shape.dims()).enumerate() {
            if i != axis {
                check_extent(lhs, rhs, "concat extent")?;
            }
        }
        total = match (total, other.shape.dims()[axis].as_static()) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
    }
    dims[axis] = total
        .map(Dimension::Static)
        .unwrap_or_else(|| derived_symbol(node.id.0, axis));
    Ok(TensorSpec::new(first.dtype, Shape::new(dims)))
}
