use super::resolve_axis;
use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{LayerKind, LayerReduceOp, TensorRef};
use crate::graph::{Node, OpKind, Operation, ReduceKind};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(
        ConverterEntry::new(OpKind::Reduce, convert_reduce)
            .with_check(check_reduce)
            .with_dynamic_shapes(),
    );
}

fn reduced_axes(axes: &[isize], rank: usize) -> Result<Vec<usize>, UnsupportedAttribute> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut resolved = axes
        .iter()
        .map(|&axis| resolve_axis(axis, rank, OpKind::Reduce))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_unstable();
    resolved.dedup();
    Ok(resolved)
}

fn check_reduce(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let (Operation::Reduce(spec), Some(input)) = (&view.node.op, view.input_spec(0)) else {
        return Ok(());
    };
    for axis in reduced_axes(&spec.axes, input.rank())? {
        if !input.shape.dims()[axis].is_static() {
            return Err(view.unsupported(format!("reduction over dynamic axis {axis}")));
        }
    }
    Ok(())
}

fn convert_reduce(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Reduce(spec) = &node.op else {
        return Err(ConversionError::internal("expected a reduce node"));
    };
    let rank = cx.input_spec(node, 0)?.rank();
    let axes = reduced_axes(&spec.axes, rank)?;
    let op = match spec.kind {
        ReduceKind::Sum => LayerReduceOp::Sum,
        ReduceKind::Mean => LayerReduceOp::Mean,
        ReduceKind::Max => LayerReduceOp::Max,
        ReduceKind::Min => LayerReduceOp::Min,
    };
    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(
        LayerKind::Reduce {
            op,
            axes,
            keep_dims: spec.keepdims,
        },
        &[input],
        out,
    )?])
}
