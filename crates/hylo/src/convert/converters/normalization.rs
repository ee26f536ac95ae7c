use crate::convert::{
    ConversionContext, ConversionError, ConversionResult, ConverterEntry, ConverterRegistry,
    NodeView, UnsupportedAttribute,
};
use crate::engine::{LayerKind, TensorRef};
use crate::graph::{Node, OpKind, Operation};

const PARAM_NAMES: [&str; 4] = ["gamma", "beta", "running mean", "running variance"];

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(
        ConverterEntry::new(OpKind::BatchNorm, convert_batch_norm)
            .with_check(check_batch_norm)
            .with_dynamic_shapes(),
    );
}

/// Inference batch norm folds into a per-channel scale, so every statistic
/// must be known at compile time.
fn check_batch_norm(view: &NodeView<'_>) -> Result<(), UnsupportedAttribute> {
    for (offset, name) in PARAM_NAMES.iter().enumerate() {
        match view.constant_input(offset + 1) {
            Some(literal) if literal.to_f32_vec().is_some() => {}
            _ => return Err(view.unsupported(format!("{name} must be a constant f32 tensor"))),
        }
    }
    if let Some(input) = view.input_spec(0) {
        if input.shape.dims().get(1).is_some_and(|dim| !dim.is_static()) {
            return Err(view.unsupported("channel extent must be static"));
        }
    }
    Ok(())
}

fn convert_batch_norm(node: &Node, cx: &mut ConversionContext<'_>) -> ConversionResult<Vec<TensorRef>> {
    let Operation::BatchNorm(spec) = &node.op else {
        return Err(ConversionError::internal("expected a batch norm node"));
    };
    let mut params = Vec::with_capacity(PARAM_NAMES.len());
    for (offset, name) in PARAM_NAMES.iter().enumerate() {
        let literal = cx.require_constant(node, offset + 1, name)?;
        let values = literal.to_f32_vec().ok_or_else(|| {
            UnsupportedAttribute::new(OpKind::BatchNorm, format!("{name} must be f32"))
        })?;
        params.push(values);
    }
    let (gamma, beta, mean, var) = (&params[0], &params[1], &params[2], &params[3]);

    let eps = spec.eps as f32;
    let scale = gamma
        .iter()
        .zip(var)
        .map(|(g, v)| g / (v + eps).sqrt())
        .collect::<Vec<_>>();
    let shift = beta
        .iter()
        .zip(mean)
        .zip(&scale)
        .map(|((b, m), s)| b - m * s)
        .collect::<Vec<_>>();
    cx.note(format!("statistics folded into a {}-channel scale", scale.len()));

    let input = cx.input(node, 0)?;
    let out = cx.output_spec(node, 0)?.clone();
    Ok(vec![cx.add_single(LayerKind::Scale { scale, shift }, &[input], out)?])
}
