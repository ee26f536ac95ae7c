use super::{align_rank, static_dims};
use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{ElementWiseOp, LayerKind, TensorRef};
use crate::graph::{Node, OpKind, Operation, TensorSpec};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(ConverterEntry::new(OpKind::MatMul, convert_matmul));
    registry.register(ConverterEntry::new(OpKind::Linear, convert_linear).with_check(check_linear));
}

fn check_linear(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    match view.input_spec(0) {
        Some(spec) if spec.rank() < 2 => {
            Err(view.unsupported("linear layers need a batched (rank >= 2) input"))
        }
        _ => Ok(()),
    }
}

fn convert_matmul(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let lhs = cx.input(node, 0)?;
    let rhs = cx.input(node, 1)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(
        LayerKind::MatrixMultiply {
            transpose_a: false,
            transpose_b: false,
        },
        &[lhs, rhs],
        out,
    )?])
}

/// Operand tensor, materialised as an engine constant when known at compile time.
fn operand_or_constant(
    node: &Node,
    cx: &mut ConversionContext<'_>,
    index: usize,
) -> ConversionResult<TensorRef> {
    match cx.constant_input(node, index) {
        Some(literal) => {
            cx.note(format!("operand {index} baked as weights {}", literal.spec));
            cx.add_constant(literal.clone())
        }
        None => cx.input(node, index),
    }
}

fn convert_linear(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Linear(spec) = &node.op else {
        return Err(ConversionError::internal("expected a linear node"));
    };
    let input = cx.input(node, 0)?;
    let weight = operand_or_constant(node, cx, 1)?;
    let out = cx.output_spec(node, 0)?.clone();
    let product = cx.add_single(
        LayerKind::MatrixMultiply {
            transpose_a: false,
            transpose_b: true,
        },
        &[input, weight],
        out.clone(),
    )?;
    if !spec.has_bias {
        return Ok(vec![product]);
    }

    let bias_spec = cx.input_spec(node, 2)?;
    static_dims(bias_spec, OpKind::Linear)?;
    let bias = operand_or_constant(node, cx, 2)?;
    let bias = align_rank(cx, bias, bias_spec, out.rank(), OpKind::Linear)?;
    let shifted = cx.add_single(
        LayerKind::ElementWise(ElementWiseOp::Sum),
        &[product, bias],
        TensorSpec::new(out.dtype, out.shape.clone()),
    )?;
    Ok(vec![shifted])
}
