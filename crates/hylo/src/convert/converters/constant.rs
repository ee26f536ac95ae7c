use crate::convert::{ConversionContext, ConversionResult, ConverterEntry, ConverterRegistry};
use crate::engine::{LayerKind, TensorRef};
use crate::graph::{Node, OpKind, Operation};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(ConverterEntry::new(OpKind::Constant, convert_constant).with_dynamic_shapes());
    registry.register(
        ConverterEntry::new(OpKind::PlaceholderConst, convert_placeholder).with_dynamic_shapes(),
    );
}

fn convert_constant(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::Constant(literal) = &node.op else {
        return Err(crate::convert::ConversionError::internal("expected a constant node"));
    };
    Ok(vec![cx.add_constant(literal.clone())?])
}

/// Bakes the operand into the engine when its contents are known, otherwise
/// passes the runtime value through unchanged.
fn convert_placeholder(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    if let Some(literal) = cx.constant_input(node, 0) {
        cx.note(format!("placeholder baked as constant {}", literal.spec));
        return Ok(vec![cx.add_constant(literal.clone())?]);
    }
    cx.note("placeholder passed through as a runtime input");
    let input = cx.input(node, 0)?;
    let spec = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(LayerKind::Identity, &[input], spec)?])
}
