//! Dense row-major kernels shared by the host interpreter and the reference
//! engine. Every kernel takes flat data plus static dims and returns the
//! result with its dims.

use std::cmp::Ordering;
use std::ops::Add;

use hylo::graph::{BinaryOp, UnaryOp};
use hylo::runtime::{HostError, HostResult};
use hylo::shape::{broadcast_static, contiguous_strides, slice_bounds, slice_len, window_output_extent};

pub fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            continue;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// Offset of `coord` (a coordinate in a broadcast result) inside an operand of
/// `dims`, treating size-1 axes as repeated.
fn broadcast_offset(coord: &[usize], dims: &[usize], strides: &[usize]) -> usize {
    let lead = coord.len() - dims.len();
    dims.iter()
        .enumerate()
        .map(|(axis, &dim)| {
            if dim == 1 {
                0
            } else {
                coord[lead + axis] * strides[axis]
            }
        })
        .sum()
}

pub fn check_len<T>(data: &[T], dims: &[usize]) -> HostResult<()> {
    let expected = dims.iter().product::<usize>();
    if data.len() == expected {
        Ok(())
    } else {
        Err(HostError::execution(format!(
            "tensor of dims {dims:?} holds {} elements, expected {expected}",
            data.len()
        )))
    }
}

fn check_rank(dims: &[usize], rank: usize, what: &str) -> HostResult<()> {
    if dims.len() == rank {
        Ok(())
    } else {
        Err(HostError::execution(format!(
            "{what} expects rank {rank}, got dims {dims:?}"
        )))
    }
}

fn check_axis(axis: usize, dims: &[usize]) -> HostResult<()> {
    if axis < dims.len() {
        Ok(())
    } else {
        Err(HostError::execution(format!(
            "axis {axis} out of range for dims {dims:?}"
        )))
    }
}

/// Splits `dims` around `axis` into (outer, extent, inner) element counts.
fn split_axis(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

pub fn unary_f32(op: UnaryOp, x: f32) -> f32 {
    match op {
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Neg => -x,
        UnaryOp::Abs => x.abs(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Erf => libm::erff(x),
    }
}

pub fn binary_f32(op: BinaryOp, a: f32, b: f32) -> f32 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
        BinaryOp::Pow => a.powf(b),
    }
}

/// Integer arithmetic wraps. Callers reject zero divisors beforehand.
pub fn binary_i64(op: BinaryOp, a: i64, b: i64) -> i64 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).unwrap_or(0),
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
        BinaryOp::Pow => a.wrapping_pow(b.clamp(0, i64::from(u32::MAX)) as u32),
    }
}

/// Applies `f` elementwise under numpy broadcasting.
pub fn broadcast_zip<T: Copy, U>(
    lhs: &[T],
    lhs_dims: &[usize],
    rhs: &[T],
    rhs_dims: &[usize],
    f: impl Fn(T, T) -> U,
) -> HostResult<(Vec<U>, Vec<usize>)> {
    check_len(lhs, lhs_dims)?;
    check_len(rhs, rhs_dims)?;
    let dims = broadcast_static(lhs_dims, rhs_dims).ok_or_else(|| {
        HostError::execution(format!("cannot broadcast {lhs_dims:?} with {rhs_dims:?}"))
    })?;
    if lhs_dims == rhs_dims {
        let values = lhs.iter().zip(rhs).map(|(&a, &b)| f(a, b)).collect();
        return Ok((values, dims));
    }
    let lhs_strides = contiguous_strides(lhs_dims);
    let rhs_strides = contiguous_strides(rhs_dims);
    let count = dims.iter().product::<usize>();
    let mut values = Vec::with_capacity(count);
    for index in 0..count {
        let coord = unravel_index(index, &dims);
        let a = lhs[broadcast_offset(&coord, lhs_dims, &lhs_strides)];
        let b = rhs[broadcast_offset(&coord, rhs_dims, &rhs_strides)];
        values.push(f(a, b));
    }
    Ok((values, dims))
}

/// Matrix product with numpy vector semantics: a rank-1 operand is promoted
/// to a matrix and its unit axis dropped from the result.
pub fn matmul_promoted(
    lhs: &[f32],
    lhs_dims: &[usize],
    rhs: &[f32],
    rhs_dims: &[usize],
    transpose_a: bool,
    transpose_b: bool,
) -> HostResult<(Vec<f32>, Vec<usize>)> {
    let mut lhs_dims = lhs_dims.to_vec();
    let mut rhs_dims = rhs_dims.to_vec();
    let lhs_vector = lhs_dims.len() == 1;
    let rhs_vector = rhs_dims.len() == 1;
    if lhs_vector {
        if transpose_a {
            lhs_dims.push(1);
        } else {
            lhs_dims.insert(0, 1);
        }
    }
    if rhs_vector {
        if transpose_b {
            rhs_dims.insert(0, 1);
        } else {
            rhs_dims.push(1);
        }
    }
    let (values, mut dims) = matmul(lhs, &lhs_dims, rhs, &rhs_dims, transpose_a, transpose_b)?;
    if rhs_vector {
        dims.pop();
    }
    if lhs_vector {
        let at = dims.len() - if rhs_vector { 1 } else { 2 };
        dims.remove(at);
    }
    Ok((values, dims))
}

/// Batched matrix product over the trailing two axes with broadcast batch axes.
pub fn matmul(
    lhs: &[f32],
    lhs_dims: &[usize],
    rhs: &[f32],
    rhs_dims: &[usize],
    transpose_a: bool,
    transpose_b: bool,
) -> HostResult<(Vec<f32>, Vec<usize>)> {
    if lhs_dims.len() < 2 || rhs_dims.len() < 2 {
        return Err(HostError::execution(format!(
            "matmul operands must have rank >= 2, got {lhs_dims:?} and {rhs_dims:?}"
        )));
    }
    check_len(lhs, lhs_dims)?;
    check_len(rhs, rhs_dims)?;
    let (lhs_batch, lhs_mat) = lhs_dims.split_at(lhs_dims.len() - 2);
    let (rhs_batch, rhs_mat) = rhs_dims.split_at(rhs_dims.len() - 2);
    let (m, k) = if transpose_a {
        (lhs_mat[1], lhs_mat[0])
    } else {
        (lhs_mat[0], lhs_mat[1])
    };
    let (rk, n) = if transpose_b {
        (rhs_mat[1], rhs_mat[0])
    } else {
        (rhs_mat[0], rhs_mat[1])
    };
    if k != rk {
        return Err(HostError::execution(format!(
            "matmul contraction mismatch: {k} vs {rk}"
        )));
    }
    let batch = broadcast_static(lhs_batch, rhs_batch).ok_or_else(|| {
        HostError::execution(format!(
            "cannot broadcast matmul batch {lhs_batch:?} with {rhs_batch:?}"
        ))
    })?;
    let batch_count = batch.iter().product::<usize>();
    let lhs_strides = contiguous_strides(lhs_batch);
    let rhs_strides = contiguous_strides(rhs_batch);
    let (lhs_size, rhs_size) = (m * k, k * n);

    let mut out = vec![0.0f32; batch_count * m * n];
    for b in 0..batch_count {
        let coord = unravel_index(b, &batch);
        let lo = broadcast_offset(&coord, lhs_batch, &lhs_strides) * lhs_size;
        let ro = broadcast_offset(&coord, rhs_batch, &rhs_strides) * rhs_size;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    let a = if transpose_a {
                        lhs[lo + p * m + i]
                    } else {
                        lhs[lo + i * k + p]
                    };
                    let w = if transpose_b {
                        rhs[ro + j * k + p]
                    } else {
                        rhs[ro + p * n + j]
                    };
                    acc += a * w;
                }
                out[(b * m + i) * n + j] = acc;
            }
        }
    }
    let mut dims = batch;
    dims.extend([m, n]);
    Ok((out, dims))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

/// NCHW convolution with OIHW weights.
pub fn conv2d(
    input: &[f32],
    input_dims: &[usize],
    weight: &[f32],
    weight_dims: &[usize],
    bias: Option<&[f32]>,
    params: Conv2dParams,
) -> HostResult<(Vec<f32>, Vec<usize>)> {
    check_rank(input_dims, 4, "conv2d input")?;
    check_rank(weight_dims, 4, "conv2d weight")?;
    check_len(input, input_dims)?;
    check_len(weight, weight_dims)?;
    let (n, c, h, w) = (input_dims[0], input_dims[1], input_dims[2], input_dims[3]);
    let (oc, icg, kh, kw) = (weight_dims[0], weight_dims[1], weight_dims[2], weight_dims[3]);
    let groups = params.groups;
    if groups == 0 || c != icg * groups || oc % groups != 0 {
        return Err(HostError::execution(format!(
            "conv2d channels {c} and weight {weight_dims:?} do not fit {groups} groups"
        )));
    }
    if let Some(bias) = bias {
        if bias.len() != oc {
            return Err(HostError::execution(format!(
                "conv2d bias has {} entries for {oc} output channels",
                bias.len()
            )));
        }
    }
    let extent = |axis: usize, input: usize, kernel: usize| {
        window_output_extent(
            input,
            kernel,
            params.stride[axis],
            params.padding[axis],
            params.dilation[axis],
        )
        .ok_or_else(|| HostError::execution(format!("conv2d window does not fit extent {input}")))
    };
    let oh = extent(0, h, kh)?;
    let ow = extent(1, w, kw)?;
    let ocg = oc / groups;

    let mut out = vec![0.0f32; n * oc * oh * ow];
    for b in 0..n {
        for o in 0..oc {
            let group = o / ocg;
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = bias.map_or(0.0, |bias| bias[o]);
                    for ci in 0..icg {
                        let channel = group * icg + ci;
                        for ky in 0..kh {
                            let iy = (y * params.stride[0] + ky * params.dilation[0]) as isize
                                - params.padding[0] as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (x * params.stride[1] + kx * params.dilation[1]) as isize
                                    - params.padding[1] as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let value =
                                    input[((b * c + channel) * h + iy as usize) * w + ix as usize];
                                let weight = weight[((o * icg + ci) * kh + ky) * kw + kx];
                                acc += value * weight;
                            }
                        }
                    }
                    out[((b * oc + o) * oh + y) * ow + x] = acc;
                }
            }
        }
    }
    Ok((out, vec![n, oc, oh, ow]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average { count_include_pad: bool },
}

/// NCHW window pooling. Padded positions never win a max and only count
/// towards an average divisor when `count_include_pad` is set.
pub fn pool2d(
    input: &[f32],
    dims: &[usize],
    mode: PoolMode,
    window: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
) -> HostResult<(Vec<f32>, Vec<usize>)> {
    check_rank(dims, 4, "pool2d input")?;
    check_len(input, dims)?;
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let oh = window_output_extent(h, window[0], stride[0], padding[0], 1)
        .ok_or_else(|| HostError::execution(format!("pool window does not fit height {h}")))?;
    let ow = window_output_extent(w, window[1], stride[1], padding[1], 1)
        .ok_or_else(|| HostError::execution(format!("pool window does not fit width {w}")))?;

    let mut out = vec![0.0f32; n * c * oh * ow];
    for plane in 0..n * c {
        let base = plane * h * w;
        for y in 0..oh {
            for x in 0..ow {
                let y0 = (y * stride[0]) as isize - padding[0] as isize;
                let x0 = (x * stride[1]) as isize - padding[1] as isize;
                let mut max = f32::NEG_INFINITY;
                let mut sum = 0.0f32;
                let mut valid = 0usize;
                for ky in 0..window[0] as isize {
                    let iy = y0 + ky;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..window[1] as isize {
                        let ix = x0 + kx;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        let value = input[base + iy as usize * w + ix as usize];
                        max = max.max(value);
                        sum += value;
                        valid += 1;
                    }
                }
                out[(plane * oh + y) * ow + x] = match mode {
                    PoolMode::Max => max,
                    PoolMode::Average { count_include_pad } => {
                        let divisor = if count_include_pad {
                            window[0] * window[1]
                        } else {
                            valid.max(1)
                        };
                        sum / divisor as f32
                    }
                };
            }
        }
    }
    Ok((out, vec![n, c, oh, ow]))
}

/// Average pooling onto a fixed output grid; bins follow floor/ceil edges.
pub fn adaptive_avg_pool2d(
    input: &[f32],
    dims: &[usize],
    output_size: [usize; 2],
) -> HostResult<(Vec<f32>, Vec<usize>)> {
    check_rank(dims, 4, "adaptive pool input")?;
    check_len(input, dims)?;
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let [oh, ow] = output_size;
    if oh == 0 || ow == 0 {
        return Err(HostError::execution("adaptive pool output size must be positive"));
    }
    let bin = |index: usize, out: usize, extent: usize| {
        let start = index * extent / out;
        let end = ((index + 1) * extent).div_ceil(out);
        (start, end)
    };

    let mut out = vec![0.0f32; n * c * oh * ow];
    for plane in 0..n * c {
        let base = plane * h * w;
        for y in 0..oh {
            let (y0, y1) = bin(y, oh, h);
            for x in 0..ow {
                let (x0, x1) = bin(x, ow, w);
                let mut sum = 0.0f32;
                for iy in y0..y1 {
                    for ix in x0..x1 {
                        sum += input[base + iy * w + ix];
                    }
                }
                let count = ((y1 - y0) * (x1 - x0)).max(1);
                out[(plane * oh + y) * ow + x] = sum / count as f32;
            }
        }
    }
    Ok((out, vec![n, c, oh, ow]))
}

/// `x * scale[c] + shift[c]` with `c` the index along axis 1.
pub fn scale_channels(input: &[f32], dims: &[usize], scale: &[f32], shift: &[f32]) -> HostResult<Vec<f32>> {
    check_len(input, dims)?;
    if dims.len() < 2 {
        return Err(HostError::execution(format!(
            "channel scale expects rank >= 2, got dims {dims:?}"
        )));
    }
    let channels = dims[1];
    if scale.len() != channels || shift.len() != channels {
        return Err(HostError::execution(format!(
            "channel scale has {}/{} entries for {channels} channels",
            scale.len(),
            shift.len()
        )));
    }
    let inner = dims[2..].iter().product::<usize>().max(1);
    Ok(input
        .iter()
        .enumerate()
        .map(|(index, &x)| {
            let c = (index / inner) % channels;
            x * scale[c] + shift[c]
        })
        .collect())
}

/// Folds inference batch norm statistics into per-channel scale and shift.
pub fn fold_batch_norm(gamma: &[f32], beta: &[f32], mean: &[f32], var: &[f32], eps: f32) -> (Vec<f32>, Vec<f32>) {
    let scale = gamma
        .iter()
        .zip(var)
        .map(|(g, v)| g / (v + eps).sqrt())
        .collect::<Vec<_>>();
    let shift = beta
        .iter()
        .zip(mean)
        .zip(&scale)
        .map(|((b, m), s)| b - m * s)
        .collect();
    (scale, shift)
}

pub fn softmax(input: &[f32], dims: &[usize], axis: usize) -> HostResult<Vec<f32>> {
    check_len(input, dims)?;
    check_axis(axis, dims)?;
    let (outer, extent, inner) = split_axis(dims, axis);
    let mut out = vec![0.0f32; input.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |a: usize| (o * extent + a) * inner + i;
            let max = (0..extent)
                .map(|a| input[at(a)])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for a in 0..extent {
                let e = (input[at(a)] - max).exp();
                out[at(a)] = e;
                sum += e;
            }
            for a in 0..extent {
                out[at(a)] /= sum;
            }
        }
    }
    Ok(out)
}

/// Output dims of a reduction over sorted, deduplicated `axes`.
pub fn reduced_dims(dims: &[usize], axes: &[usize], keepdims: bool) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .filter_map(|(axis, &dim)| match (axes.contains(&axis), keepdims) {
            (false, _) => Some(dim),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

/// Folds every element into its reduced slot with `f`, starting from `init`.
pub fn reduce_with<T: Copy>(
    input: &[T],
    dims: &[usize],
    axes: &[usize],
    keepdims: bool,
    init: T,
    f: impl Fn(T, T) -> T,
) -> HostResult<(Vec<T>, Vec<usize>)> {
    check_len(input, dims)?;
    for &axis in axes {
        check_axis(axis, dims)?;
    }
    let kept = reduced_dims(dims, axes, true);
    let kept_strides = contiguous_strides(&kept);
    let mut out = vec![init; kept.iter().product()];
    for (index, &value) in input.iter().enumerate() {
        let coord = unravel_index(index, dims);
        let slot = coord
            .iter()
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(axis, &c)| c * kept_strides[axis])
            .sum::<usize>();
        out[slot] = f(out[slot], value);
    }
    Ok((out, reduced_dims(dims, axes, keepdims)))
}

pub fn reduce_sum(input: &[f32], dims: &[usize], axes: &[usize], keepdims: bool) -> HostResult<(Vec<f32>, Vec<usize>)> {
    reduce_with(input, dims, axes, keepdims, 0.0, |a, b| a + b)
}

pub fn reduce_mean(input: &[f32], dims: &[usize], axes: &[usize], keepdims: bool) -> HostResult<(Vec<f32>, Vec<usize>)> {
    let (mut out, out_dims) = reduce_sum(input, dims, axes, keepdims)?;
    let count = axes.iter().map(|&axis| dims[axis]).product::<usize>().max(1) as f32;
    for value in &mut out {
        *value /= count;
    }
    Ok((out, out_dims))
}

pub fn reduce_max(input: &[f32], dims: &[usize], axes: &[usize], keepdims: bool) -> HostResult<(Vec<f32>, Vec<usize>)> {
    reduce_with(input, dims, axes, keepdims, f32::NEG_INFINITY, f32::max)
}

pub fn reduce_min(input: &[f32], dims: &[usize], axes: &[usize], keepdims: bool) -> HostResult<(Vec<f32>, Vec<usize>)> {
    reduce_with(input, dims, axes, keepdims, f32::INFINITY, f32::min)
}

/// Index of the first maximum along `axis`.
pub fn argmax<T: Copy + PartialOrd>(
    input: &[T],
    dims: &[usize],
    axis: usize,
    keepdims: bool,
) -> HostResult<(Vec<i64>, Vec<usize>)> {
    check_len(input, dims)?;
    check_axis(axis, dims)?;
    let (outer, extent, inner) = split_axis(dims, axis);
    if extent == 0 {
        return Err(HostError::execution("argmax over an empty axis"));
    }
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut best = 0usize;
            for a in 1..extent {
                if input[(o * extent + a) * inner + i] > input[(o * extent + best) * inner + i] {
                    best = a;
                }
            }
            out.push(best as i64);
        }
    }
    Ok((out, reduced_dims(dims, &[axis], keepdims)))
}

/// The `k` largest (or smallest) entries along `axis` and their indices.
/// Ties keep their original order.
pub fn topk<T: Copy + PartialOrd>(
    input: &[T],
    dims: &[usize],
    k: usize,
    axis: usize,
    largest: bool,
) -> HostResult<(Vec<T>, Vec<i64>, Vec<usize>)> {
    check_len(input, dims)?;
    check_axis(axis, dims)?;
    let (outer, extent, inner) = split_axis(dims, axis);
    if k > extent {
        return Err(HostError::execution(format!(
            "topk k={k} exceeds axis extent {extent}"
        )));
    }
    let mut out_dims = dims.to_vec();
    out_dims[axis] = k;
    let mut values = vec![None; outer * k * inner];
    let mut indices = vec![0i64; outer * k * inner];
    for o in 0..outer {
        for i in 0..inner {
            let mut line = (0..extent)
                .map(|a| (input[(o * extent + a) * inner + i], a))
                .collect::<Vec<_>>();
            line.sort_by(|(a, _), (b, _)| {
                let ordering = a.partial_cmp(b).unwrap_or(Ordering::Equal);
                if largest {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            for (rank, (value, index)) in line.into_iter().take(k).enumerate() {
                let slot = (o * k + rank) * inner + i;
                values[slot] = Some(value);
                indices[slot] = index as i64;
            }
        }
    }
    let values = values.into_iter().flatten().collect();
    Ok((values, indices, out_dims))
}

pub fn cumsum<T: Copy + Default + Add<Output = T>>(input: &[T], dims: &[usize], axis: usize) -> HostResult<Vec<T>> {
    check_len(input, dims)?;
    check_axis(axis, dims)?;
    let (outer, extent, inner) = split_axis(dims, axis);
    let mut out = input.to_vec();
    for o in 0..outer {
        for i in 0..inner {
            let mut acc = T::default();
            for a in 0..extent {
                let index = (o * extent + a) * inner + i;
                acc = acc + input[index];
                out[index] = acc;
            }
        }
    }
    Ok(out)
}

pub fn transpose<T: Copy>(input: &[T], dims: &[usize], perm: &[usize]) -> HostResult<(Vec<T>, Vec<usize>)> {
    check_len(input, dims)?;
    let mut seen = vec![false; dims.len()];
    if perm.len() != dims.len()
        || perm
            .iter()
            .any(|&axis| axis >= dims.len() || std::mem::replace(&mut seen[axis], true))
    {
        return Err(HostError::execution(format!(
            "{perm:?} is not a permutation of rank {}",
            dims.len()
        )));
    }
    let out_dims = perm.iter().map(|&axis| dims[axis]).collect::<Vec<_>>();
    let strides = contiguous_strides(dims);
    let mut out = Vec::with_capacity(input.len());
    for index in 0..input.len() {
        let coord = unravel_index(index, &out_dims);
        let source = coord
            .iter()
            .zip(perm)
            .map(|(&c, &axis)| c * strides[axis])
            .sum::<usize>();
        out.push(input[source]);
    }
    Ok((out, out_dims))
}

pub fn concat<T: Copy>(parts: &[(&[T], &[usize])], axis: usize) -> HostResult<(Vec<T>, Vec<usize>)> {
    let Some((_, first)) = parts.first() else {
        return Err(HostError::execution("concat needs at least one operand"));
    };
    check_axis(axis, first)?;
    let mut out_dims = first.to_vec();
    out_dims[axis] = 0;
    for (data, dims) in parts {
        check_len(data, dims)?;
        let compatible = dims.len() == first.len()
            && dims
                .iter()
                .zip(first.iter())
                .enumerate()
                .all(|(a, (x, y))| a == axis || x == y);
        if !compatible {
            return Err(HostError::execution(format!(
                "cannot concatenate {dims:?} with {first:?} on axis {axis}"
            )));
        }
        out_dims[axis] += dims[axis];
    }
    let outer = first[..axis].iter().product::<usize>();
    let mut out = Vec::with_capacity(out_dims.iter().product());
    for o in 0..outer {
        for (data, dims) in parts {
            let chunk = dims[axis..].iter().product::<usize>();
            out.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok((out, out_dims))
}

/// `size` entries along `axis` starting at `start`, `stride` apart.
pub fn slice_range<T: Copy>(
    input: &[T],
    dims: &[usize],
    axis: usize,
    start: usize,
    size: usize,
    stride: usize,
) -> HostResult<(Vec<T>, Vec<usize>)> {
    check_len(input, dims)?;
    check_axis(axis, dims)?;
    let (outer, extent, inner) = split_axis(dims, axis);
    if stride == 0 || (size > 0 && start + (size - 1) * stride >= extent) {
        return Err(HostError::execution(format!(
            "slice of {size} from {start} by {stride} exceeds extent {extent}"
        )));
    }
    let mut out = Vec::with_capacity(outer * size * inner);
    for o in 0..outer {
        for s in 0..size {
            let base = (o * extent + start + s * stride) * inner;
            out.extend_from_slice(&input[base..base + inner]);
        }
    }
    let mut out_dims = dims.to_vec();
    out_dims[axis] = size;
    Ok((out, out_dims))
}

/// Python-style slice with clamped, possibly negative bounds.
pub fn slice<T: Copy>(
    input: &[T],
    dims: &[usize],
    axis: usize,
    start: i64,
    end: i64,
    step: usize,
) -> HostResult<(Vec<T>, Vec<usize>)> {
    check_axis(axis, dims)?;
    let extent = dims[axis];
    let (lo, _) = slice_bounds(start, end, extent);
    let size = slice_len(start, end, step, extent);
    slice_range(input, dims, axis, lo, size, step.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_adds_row_vector() {
        let (values, dims) =
            broadcast_zip(&[1.0, 2.0, 3.0, 4.0], &[2, 2], &[10.0, 20.0], &[2], |a, b| a + b)
                .expect("broadcast");
        assert_eq!(dims, vec![2, 2]);
        assert_eq!(values, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn matmul_with_transposed_rhs_matches_plain() {
        let lhs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let rhs = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let (plain, dims) = matmul(&lhs, &[2, 3], &rhs, &[3, 2], false, false).expect("matmul");
        let (rhs_t, rhs_t_dims) = transpose(&rhs, &[3, 2], &[1, 0]).expect("transpose");
        let (transposed, _) =
            matmul(&lhs, &[2, 3], &rhs_t, &rhs_t_dims, false, true).expect("matmul");
        assert_eq!(dims, vec![2, 2]);
        assert_eq!(plain, vec![4.0, 5.0, 10.0, 11.0]);
        assert_eq!(plain, transposed);
    }

    #[test]
    fn vector_operands_follow_numpy_promotion() {
        let matrix = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let (row, dims) =
            matmul_promoted(&[1.0, 0.0, -1.0], &[3], &matrix, &[3, 2], false, false).expect("vec @ mat");
        assert_eq!(dims, vec![2]);
        assert_eq!(row, vec![-4.0, -4.0]);

        let (col, dims) =
            matmul_promoted(&matrix, &[2, 3], &[1.0, 1.0, 1.0], &[3], false, false).expect("mat @ vec");
        assert_eq!(dims, vec![2]);
        assert_eq!(col, vec![6.0, 15.0]);

        let (dot, dims) =
            matmul_promoted(&[1.0, 2.0], &[2], &[3.0, 4.0], &[2], false, false).expect("dot");
        assert!(dims.is_empty());
        assert_eq!(dot, vec![11.0]);
    }

    #[test]
    fn conv2d_identity_kernel_with_padding() {
        let input = (0..9).map(|v| v as f32).collect::<Vec<_>>();
        let weight = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let params = Conv2dParams {
            stride: [1, 1],
            padding: [1, 1],
            dilation: [1, 1],
            groups: 1,
        };
        let (out, dims) =
            conv2d(&input, &[1, 1, 3, 3], &weight, &[1, 1, 3, 3], Some(&[0.5]), params)
                .expect("conv");
        assert_eq!(dims, vec![1, 1, 3, 3]);
        assert_eq!(out, input.iter().map(|v| v + 0.5).collect::<Vec<_>>());
    }

    #[test]
    fn average_pool_divisor_respects_padding_flag() {
        let input = [1.0, 2.0, 3.0, 4.0];
        let window = [2, 2];
        let (with_pad, _) = pool2d(
            &input,
            &[1, 1, 2, 2],
            PoolMode::Average { count_include_pad: true },
            window,
            [2, 2],
            [1, 1],
        )
        .expect("pool");
        let (without_pad, dims) = pool2d(
            &input,
            &[1, 1, 2, 2],
            PoolMode::Average { count_include_pad: false },
            window,
            [2, 2],
            [1, 1],
        )
        .expect("pool");
        assert_eq!(dims, vec![1, 1, 2, 2]);
        assert_eq!(with_pad, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(without_pad, input.to_vec());
    }

    #[test]
    fn adaptive_pool_uses_overlapping_bins() {
        let input = [1.0, 2.0, 3.0];
        let (out, dims) = adaptive_avg_pool2d(&input, &[1, 1, 1, 3], [1, 2]).expect("pool");
        assert_eq!(dims, vec![1, 1, 1, 2]);
        assert_eq!(out, vec![1.5, 2.5]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let out = softmax(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &[2, 3], 1).expect("softmax");
        let first = out[..3].iter().sum::<f32>();
        assert!((first - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn reductions_over_multiple_axes() {
        let input = (1..=8).map(|v| v as f32).collect::<Vec<_>>();
        let (sum, dims) = reduce_sum(&input, &[2, 2, 2], &[0, 2], false).expect("sum");
        assert_eq!(dims, vec![2]);
        assert_eq!(sum, vec![1.0 + 2.0 + 5.0 + 6.0, 3.0 + 4.0 + 7.0 + 8.0]);
        let (mean, dims) = reduce_mean(&input, &[2, 4], &[1], true).expect("mean");
        assert_eq!(dims, vec![2, 1]);
        assert_eq!(mean, vec![2.5, 6.5]);
    }

    #[test]
    fn topk_and_argmax_agree_on_the_winner() {
        let input = [3.0, 9.0, 1.0, 9.0];
        let (values, indices, dims) = topk(&input, &[4], 2, 0, true).expect("topk");
        assert_eq!(dims, vec![2]);
        assert_eq!(values, vec![9.0, 9.0]);
        assert_eq!(indices, vec![1, 3]);
        let (best, _) = argmax(&input, &[4], 0, false).expect("argmax");
        assert_eq!(best, vec![1]);
    }

    #[test]
    fn slicing_and_concat_round_out_shapes() {
        let input = (0..6).collect::<Vec<i64>>();
        let (tail, dims) = slice(&input, &[2, 3], 1, -2, i64::MAX, 1).expect("slice");
        assert_eq!(dims, vec![2, 2]);
        assert_eq!(tail, vec![1, 2, 4, 5]);
        let (joined, dims) =
            concat(&[(&input[..], &[2, 3][..]), (&tail[..], &[2, 2][..])], 1).expect("concat");
        assert_eq!(dims, vec![2, 5]);
        assert_eq!(joined, vec![0, 1, 2, 1, 2, 3, 4, 5, 4, 5]);
        assert_eq!(cumsum(&input, &[2, 3], 1).expect("cumsum"), vec![0, 1, 3, 3, 7, 12]);
    }
}
