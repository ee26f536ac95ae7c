use super::resolve_axis;
use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{ActivationKind, LayerKind, TensorRef, UnaryKind};
use crate::graph::{Node, OpKind, Operation, UnaryOp};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(
        ConverterEntry::new(OpKind::Unary, convert_unary)
            .with_check(check_unary)
            .with_dynamic_shapes(),
    );
    registry.register(
        ConverterEntry::new(OpKind::Clamp, convert_clamp)
            .with_check(check_float_input)
            .with_dynamic_shapes(),
    );
    registry.register(
        ConverterEntry::new(OpKind::LeakyRelu, convert_leaky_relu).with_dynamic_shapes(),
    );
    registry.register(
        ConverterEntry::new(OpKind::Softmax, convert_softmax)
            .with_check(check_softmax)
            .with_dynamic_shapes(),
    );
}

fn layer_for_unary(op: UnaryOp) -> Option<LayerKind> {
    Some(match op {
        UnaryOp::Relu => LayerKind::Activation(ActivationKind::Relu),
        UnaryOp::Sigmoid => LayerKind::Activation(ActivationKind::Sigmoid),
        UnaryOp::Tanh => LayerKind::Activation(ActivationKind::Tanh),
        UnaryOp::Exp => LayerKind::Unary(UnaryKind::Exp),
        UnaryOp::Log => LayerKind::Unary(UnaryKind::Log),
        UnaryOp::Neg => LayerKind::Unary(UnaryKind::Neg),
        UnaryOp::Abs => LayerKind::Unary(UnaryKind::Abs),
        UnaryOp::Sqrt => LayerKind::Unary(UnaryKind::Sqrt),
        UnaryOp::Erf => return None,
    })
}

fn check_unary(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let Operation::Unary(op) = &view.node.op else {
        return Ok(());
    };
    if layer_for_unary(*op).is_none() {
        return Err(view.unsupported(format!("{op:?} has no engine layer")));
    }
    Ok(())
}

fn check_float_input(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    match view.input_spec(0) {
        Some(spec) if !spec.dtype.is_float() => {
            Err(view.unsupported(format!("engine activations require float input, got {}", spec.dtype)))
        }
        _ => Ok(()),
    }
}

fn check_softmax(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let (Operation::Softmax(spec), Some(input)) = (&view.node.op, view.input_spec(0)) else {
        return Ok(());
    };
    let axis = resolve_axis(spec.axis, input.rank(), OpKind::Softmax)?;
    if !input.shape.dims()[axis].is_static() {
        return Err(view.unsupported("softmax over a dynamic axis"));
    }
    Ok(())
}

fn passthrough(
    node: &Node,
    cx: &mut ConversionContext<'_>,
    kind: LayerKind,
) -> ConversionResult<Vec<TensorRef>> {
    let input = cx.input(node, 0)?;
    let spec = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(kind, &[input], spec)?])
}

fn convert_unary(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Unary(op) = &node.op else {
        return Err(ConversionError::internal("expected a unary node"));
    };
    let kind = layer_for_unary(*op)
        .ok_or_else(|| UnsupportedAttribute::new(OpKind::Unary, format!("{op:?} has no engine layer")))?;
    passthrough(node, cx, kind)
}

fn convert_clamp(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Clamp(spec) = &node.op else {
        return Err(ConversionError::internal("expected a clamp node"));
    };
    let min = spec.min.map_or(f32::NEG_INFINITY, |value| value as f32);
    let max = spec.max.map_or(f32::INFINITY, |value| value as f32);
    passthrough(node, cx, LayerKind::Activation(ActivationKind::Clip { min, max }))
}

fn convert_leaky_relu(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::LeakyRelu(spec) = &node.op else {
        return Err(ConversionError::internal("expected a leaky relu node"));
    };
    let alpha = spec.negative_slope as f32;
    passthrough(node, cx, LayerKind::Activation(ActivationKind::LeakyRelu { alpha }))
}

fn convert_softmax(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Softmax(spec) = &node.op else {
        return Err(ConversionError::internal("expected a softmax node"));
    };
    let rank = cx.input_spec(node, 0)?.rank();
    let axis = resolve_axis(spec.axis, rank, OpKind::Softmax)?;
    passthrough(node, cx, LayerKind::SoftMax { axis })
}
