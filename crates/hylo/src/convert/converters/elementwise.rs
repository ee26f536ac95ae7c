use super::align_rank;
use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{ElementWiseOp, LayerKind, TensorRef};
use crate::graph::{BinaryOp, Node, OpKind, Operation};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(
        ConverterEntry::new(OpKind::Binary, convert_binary)
            .with_check(check_binary)
            .with_dynamic_shapes(),
    );
}

fn layer_op(op: BinaryOp) -> ElementWiseOp {
    match op {
        BinaryOp::Add => ElementWiseOp::Sum,
        BinaryOp::Sub => ElementWiseOp::Sub,
        BinaryOp::Mul => ElementWiseOp::Prod,
        BinaryOp::Div => ElementWiseOp::Div,
        BinaryOp::Maximum => ElementWiseOp::Max,
        BinaryOp::Minimum => ElementWiseOp::Min,
        BinaryOp::Pow => ElementWiseOp::Pow,
    }
}

/// Rank alignment needs the lower-rank operand's extents up front.
fn check_binary(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    let (Some(lhs), Some(rhs)) = (view.input_spec(0), view.input_spec(1)) else {
        return Ok(());
    };
    let lower = if lhs.rank() < rhs.rank() {
        Some(lhs)
    } else if rhs.rank() < lhs.rank() {
        Some(rhs)
    } else {
        None
    };
    match lower {
        Some(spec) if !spec.is_static() => Err(view.unsupported(format!(
            "rank broadcast of dynamic operand {spec}"
        ))),
        _ => Ok(()),
    }
}

fn convert_binary(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Binary(op) = &node.op else {
        return Err(ConversionError::internal("expected a binary node"));
    };
    let lhs_spec = cx.input_spec(node, 0)?;
    let rhs_spec = cx.input_spec(node, 1)?;
    let out = cx.output_spec(node, 0)?.clone();
    let rank = out.rank();

    let lhs = cx.input(node, 0)?;
    let rhs = cx.input(node, 1)?;
    let lhs = align_rank(cx, lhs, lhs_spec, rank, OpKind::Binary)?;
    let rhs = align_rank(cx, rhs, rhs_spec, rank, OpKind::Binary)?;
    Ok(vec![cx.add_single(
        LayerKind::ElementWise(layer_op(*op)),
        &[lhs, rhs],
        out,
    )?])
}
