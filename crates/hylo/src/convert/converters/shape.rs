use super::{resolve_axis, static_dims};
use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{LayerKind, TensorRef};
use crate::graph::{Node, OpKind, Operation};
use crate::shape::slice_bounds;

pub(super) fn register(registry: &mut ConverterRegistry) {
    for kind in [OpKind::Reshape, OpKind::Flatten, OpKind::Squeeze, OpKind::Unsqueeze] {
        registry.register(ConverterEntry::new(kind, convert_static_reshape));
    }
    registry.register(ConverterEntry::new(OpKind::Transpose, convert_transpose).with_dynamic_shapes());
    registry.register(ConverterEntry::new(OpKind::Concat, convert_concat));
    registry.register(
        ConverterEntry::new(OpKind::Slice, convert_slice)
            .with_check(check_slice)
            .with_dynamic_shapes(),
    );
    registry.register(ConverterEntry::new(OpKind::Cast, convert_cast).with_dynamic_shapes());
    registry.register(ConverterEntry::new(OpKind::Identity, convert_identity).with_dynamic_shapes());
    registry.register(ConverterEntry::new(OpKind::Dropout, convert_identity).with_dynamic_shapes());
}

/// Every pure view change lowers to a shuffle with a static target shape.
fn convert_static_reshape(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let out = cx.output_spec(node, 0)?.clone();
    let dims = static_dims(&out, node.kind())?;
    let input = cx.input(node, 0)?;
    Ok(vec![cx.add_single(
        LayerKind::Shuffle {
            first_transpose: None,
            reshape: Some(dims),
        },
        &[input],
        out,
    )?])
}

fn convert_transpose(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Transpose(spec) = &node.op else {
        return Err(ConversionError::internal("expected a transpose node"));
    };
    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(
        LayerKind::Shuffle {
            first_transpose: Some(spec.perm.clone()),
            reshape: None,
        },
        &[input],
        out,
    )?])
}

fn convert_concat(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Concat(spec) = &node.op else {
        return Err(ConversionError::internal("expected a concat node"));
    };
    let out = cx.output_spec(node, 0)?.clone();
    let axis = resolve_axis(spec.axis, out.rank(), OpKind::Concat)?;
    let inputs = (0..node.inputs.len())
        .map(|index| cx.input(node, index))
        .collect::<ConversionResult<Vec<_>>>()?;
    Ok(vec![cx.add_single(LayerKind::Concatenation { axis }, &inputs, out)?])
}

fn check_slice(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let (Operation::Slice(spec), Some(input)) = (&view.node.op, view.input_spec(0)) else {
        return Ok(());
    };
    let axis = resolve_axis(spec.axis, input.rank(), OpKind::Slice)?;
    if !input.shape.dims()[axis].is_static() {
        return Err(view.unsupported(format!("slice along dynamic axis {axis}")));
    }
    Ok(())
}

fn convert_slice(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Slice(spec) = &node.op else {
        return Err(ConversionError::internal("expected a slice node"));
    };
    let input_spec = cx.input_spec(node, 0)?;
    let axis = resolve_axis(spec.axis, input_spec.rank(), OpKind::Slice)?;
    let extent = input_spec.shape.dims()[axis]
        .as_static()
        .ok_or_else(|| UnsupportedAttribute::new(OpKind::Slice, "slice along a dynamic axis"))?;
    let (start, _) = slice_bounds(spec.start, spec.end, extent);
    let out = cx.output_spec(node, 0)?.clone();
    let size = out.shape.dims()[axis].as_static().unwrap_or(0);
    let input = cx.input(node, 0)?;
    Ok(vec![cx.add_single(
        LayerKind::Slice {
            axis,
            start,
            size,
            stride: spec.step,
        },
        &[input],
        out,
    )?])
}

fn convert_cast(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Cast(spec) = &node.op else {
        return Err(ConversionError::internal("expected a cast node"));
    };
    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(LayerKind::Cast { dtype: spec.dtype }, &[input], out)?])
}

fn convert_identity(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(LayerKind::Identity, &[input], out)?])
}
