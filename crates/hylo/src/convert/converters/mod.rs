mod activation;
mod constant;
mod conv;
mod elementwise;
mod linalg;
mod normalization;
mod pooling;
mod reduce;
mod shape;

use super::{ConversionContext, ConversionError, ConversionResult, ConverterRegistry, UnsupportedAttribute};
use crate::engine::{LayerKind, TensorRef};
use crate::graph::{OpKind, TensorSpec};
use crate::shape::normalize_axis;

pub(super) fn register_all(registry: &mut ConverterRegistry) {
    constant::register(registry);
    activation::register(registry);
    elementwise::register(registry);
    linalg::register(registry);
    conv::register(registry);
    pooling::register(registry);
    normalization::register(registry);
    reduce::register(registry);
    shape::register(registry);
}

fn static_dims(spec: &TensorSpec, kind: OpKind) -> ConversionResult<Vec<usize>> {
    spec.shape.static_dims().ok_or_else(|| {
        ConversionError::from(UnsupportedAttribute::new(
            kind,
            format!("{} has dynamic extents", spec),
        ))
    })
}

fn resolve_axis(axis: isize, rank: usize, kind: OpKind) -> Result<usize, UnsupportedAttribute> {
    normalize_axis(axis, rank)
        .ok_or_else(|| UnsupportedAttribute::new(kind, format!("axis {axis} out of range for rank {rank}")))
}

/// Reshapes `tensor` to `rank` by prepending unit axes.
fn align_rank(
    cx: &mut ConversionContext<'_>,
    tensor: TensorRef,
    spec: &TensorSpec,
    rank: usize,
    kind: OpKind,
) -> ConversionResult<TensorRef> {
    if spec.rank() >= rank {
        return Ok(tensor);
    }
    let dims = static_dims(spec, kind)?;
    let mut aligned = vec![1; rank - dims.len()];
    aligned.extend(dims);
    cx.add_single(
        LayerKind::Shuffle {
            first_transpose: None,
            reshape: Some(aligned.clone()),
        },
        &[tensor],
        TensorSpec::with_static(spec.dtype, &aligned),
    )
}
