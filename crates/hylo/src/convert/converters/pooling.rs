use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{LayerKind, PoolingKind, TensorRef};
use crate::graph::{Node, OpKind, Operation, TensorSpec};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(
        ConverterEntry::new(OpKind::MaxPool2d, convert_pool)
            .with_check(check_static_spatial)
            .with_dynamic_shapes(),
    );
    registry.register(
        ConverterEntry::new(OpKind::AvgPool2d, convert_pool)
            .with_check(check_static_spatial)
            .with_dynamic_shapes(),
    );
    registry.register(
        ConverterEntry::new(OpKind::AdaptiveAvgPool2d, convert_adaptive)
            .with_check(check_adaptive)
            .with_dynamic_shapes(),
    );
}

fn spatial_extents(spec: &TensorSpec) -> Option<[usize; 2]> {
    let dims = spec.shape.dims();
    if dims.len() != 4 {
        return None;
    }
    Some([dims[2].as_static()?, dims[3].as_static()?])
}

fn check_static_spatial(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    match view.input_spec(0) {
        Some(spec) if spatial_extents(spec).is_none() => {
            Err(view.unsupported(format!("pooling needs static spatial extents, got {}", spec.shape)))
        }
        _ => Ok(()),
    }
}

/// Adaptive pooling maps onto a fixed window only when the extents divide evenly.
fn check_adaptive(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let (Operation::AdaptiveAvgPool2d(spec), Some(input)) = (&view.node.op, view.input_spec(0)) else {
        return Ok(());
    };
    let extents = spatial_extents(input)
        .ok_or_else(|| view.unsupported("adaptive pooling needs static spatial extents"))?;
    for (extent, target) in extents.iter().zip(spec.output_size) {
        if extent % target != 0 {
            return Err(view.unsupported(format!(
                "input extent {extent} is not a multiple of output extent {target}"
            )));
        }
    }
    Ok(())
}

fn convert_pool(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let (kind, spec) = match &node.op {
        Operation::MaxPool2d(spec) => (PoolingKind::Max, spec),
        Operation::AvgPool2d(spec) => (PoolingKind::Average, spec),
        _ => return Err(ConversionError::internal("expected a pooling node")),
    };
    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(
        LayerKind::Pooling {
            kind,
            window: spec.kernel,
            stride: spec.stride,
            padding: spec.padding,
            count_include_pad: spec.count_include_pad,
        },
        &[input],
        out,
    )?])
}

fn convert_adaptive(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::AdaptiveAvgPool2d(spec) = &node.op else {
        return Err(ConversionError::internal("expected an adaptive pooling node"));
    };
    let input_spec = cx.input_spec(node, 0)?;
    let extents = spatial_extents(input_spec).ok_or_else(|| {
        UnsupportedAttribute::new(OpKind::AdaptiveAvgPool2d, "spatial extents must be static")
    })?;
    let window = [
        extents[0] / spec.output_size[0],
        extents[1] / spec.output_size[1],
    ];
    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(
        LayerKind::Pooling {
            kind: PoolingKind::Average,
            window,
            stride: window,
            padding: [0, 0],
            count_include_pad: false,
        },
        &[input],
        out,
    )?])
}
