//! Shape arithmetic shared by inference, conversion and the reference kernels.

use crate::graph::{DimSymbol, Dimension};

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Option<usize> {
    let rank = rank as isize;
    let resolved = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&resolved).then_some(resolved as usize)
}

/// Like [`normalize_axis`] but admits `rank` itself, as insertion points do.
pub fn normalize_insert_axis(axis: isize, rank: usize) -> Option<usize> {
    normalize_axis(axis, rank + 1)
}

/// Broadcasts two concrete shapes with numpy rules.
pub fn broadcast_static(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for (i, slot) in out.iter_mut().enumerate() {
        let l = dim_from_right(lhs, rank - 1 - i);
        let r = dim_from_right(rhs, rank - 1 - i);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

fn dim_from_right(dims: &[usize], offset: usize) -> usize {
    if offset < dims.len() {
        dims[dims.len() - 1 - offset]
    } else {
        1
    }
}

/// Broadcasts two symbolic extents. A dynamic extent paired with a static one
/// other than 1 is assumed to match it.
pub fn broadcast_dim(lhs: &Dimension, rhs: &Dimension) -> Result<Dimension, String> {
    match (lhs, rhs) {
        (Dimension::Static(a), Dimension::Static(b)) => match (a, b) {
            _ if a == b => Ok(Dimension::Static(*a)),
            (1, _) => Ok(Dimension::Static(*b)),
            (_, 1) => Ok(Dimension::Static(*a)),
            _ => Err(format!("cannot broadcast {a} against {b}")),
        },
        (Dimension::Static(1), dynamic @ Dimension::Dynamic(_))
        | (dynamic @ Dimension::Dynamic(_), Dimension::Static(1)) => Ok(dynamic.clone()),
        (Dimension::Static(n), Dimension::Dynamic(_))
        | (Dimension::Dynamic(_), Dimension::Static(n)) => Ok(Dimension::Static(*n)),
        (Dimension::Dynamic(a), Dimension::Dynamic(_)) => Ok(Dimension::Dynamic(a.clone())),
    }
}

pub fn broadcast_shapes(lhs: &[Dimension], rhs: &[Dimension]) -> Result<Vec<Dimension>, String> {
    let rank = lhs.len().max(rhs.len());
    let one = Dimension::Static(1);
    (0..rank)
        .map(|i| {
            let offset = rank - 1 - i;
            let l = lhs.len().checked_sub(offset + 1).map_or(&one, |idx| &lhs[idx]);
            let r = rhs.len().checked_sub(offset + 1).map_or(&one, |idx| &rhs[idx]);
            broadcast_dim(l, r)
        })
        .collect()
}

/// Output extent of a strided window over `input` padded by `padding` on both sides.
pub fn window_output_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    if stride == 0 || kernel == 0 || dilation == 0 {
        return None;
    }
    let effective = dilation * (kernel - 1) + 1;
    let padded = input + 2 * padding;
    if padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}

/// Resolved `[start, end)` bounds of a Python-style slice over `extent` elements.
pub fn slice_bounds(start: i64, end: i64, extent: usize) -> (usize, usize) {
    let extent_i = extent as i64;
    let clamp = |index: i64| -> usize {
        let resolved = if index < 0 { index.saturating_add(extent_i) } else { index };
        resolved.clamp(0, extent_i) as usize
    };
    let lo = clamp(start);
    let hi = clamp(end);
    (lo, hi.max(lo))
}

/// Number of elements a strided slice selects.
pub fn slice_len(start: i64, end: i64, step: usize, extent: usize) -> usize {
    let (lo, hi) = slice_bounds(start, end, extent);
    if step == 0 {
        return 0;
    }
    (hi - lo).div_ceil(step)
}

/// Row-major strides for `dims`.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

/// Fresh symbol for an extent that only becomes known at run time.
pub fn derived_symbol(node: u32, axis: usize) -> Dimension {
    Dimension::Dynamic(DimSymbol::new(format!("n{node}_{axis}")))
}
