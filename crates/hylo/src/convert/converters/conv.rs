use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{LayerKind, TensorRef};
use crate::graph::{Node, OpKind, Operation};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(
        ConverterEntry::new(OpKind::Conv2d, convert_conv2d)
            .with_check(check_conv2d)
            .with_dynamic_shapes(),
    );
}

/// Kernels are baked into the engine, and only the batch extent may vary.
fn check_conv2d(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let Operation::Conv2d(spec) = &view.node.op else {
        return Ok(());
    };
    if view.constant_input(1).is_none() {
        return Err(view.unsupported("convolution weights must be compile-time constants"));
    }
    if spec.has_bias && view.constant_input(2).is_none() {
        return Err(view.unsupported("convolution bias must be a compile-time constant"));
    }
    if let Some(input) = view.input_spec(0) {
        if input.shape.dims().iter().skip(1).any(|dim| !dim.is_static()) {
            return Err(view.unsupported(format!(
                "only the batch extent may be dynamic, got {}",
                input.shape
            )));
        }
    }
    Ok(())
}

fn convert_conv2d(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Conv2d(spec) = &node.op else {
        return Err(ConversionError::internal("expected a conv2d node"));
    };
    let input = cx.input(node, 0)?;
    let kernel = cx.require_constant(node, 1, "convolution weight")?.clone();
    let bias = if spec.has_bias {
        Some(cx.require_constant(node, 2, "convolution bias")?.clone())
    } else {
        None
    };
    cx.note(format!(
        "kernel {} baked{}",
        kernel.spec,
        if bias.is_some() { " with bias" } else { "" }
    ));
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(
        LayerKind::Convolution {
            kernel,
            bias,
            stride: spec.stride,
            padding: spec.padding,
            dilation: spec.dilation,
            groups: spec.groups,
        },
        &[input],
        out,
    )?])
}
