use hylo::graph::{
    Conv2dSpec, DType, Dimension, FlattenSpec, GraphBuilder, LinearSpec, NodeId, Operation,
    Pool2dSpec, ReduceKind, ReduceSpec, Shape, TensorLiteral, TensorSpec, TopKSpec, UnaryOp,
};
use hylo::propagate::propagate;

fn f32_spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::with_static(DType::F32, dims)
}

#[test]
fn convolution_pipeline_resolves_static_shapes() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(&[4, 3, 3, 3], &[0.1; 108]));
    let conv = builder.emit_single(
        Operation::Conv2d(Conv2dSpec {
            padding: [1, 1],
            ..Conv2dSpec::default()
        }),
        vec![x, weight],
    );
    let pooled = builder.emit_single(Operation::MaxPool2d(Pool2dSpec::square(2, 2, 0)), vec![conv]);
    let flat = builder.emit_single(
        Operation::Flatten(FlattenSpec {
            start_axis: 1,
            end_axis: -1,
        }),
        vec![pooled],
    );
    let graph = builder.finish("conv", vec![flat]);

    let types = propagate(&graph, &[f32_spec(&[2, 3, 8, 8])]).expect("propagate");
    assert_eq!(types.get(conv), Some(&f32_spec(&[2, 4, 8, 8])));
    assert_eq!(types.get(pooled), Some(&f32_spec(&[2, 4, 4, 4])));
    assert_eq!(types.get(flat), Some(&f32_spec(&[2, 64])));
}

#[test]
fn dynamic_batch_flows_through_elementwise_ops() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let relu = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![x]);
    let sum = builder.emit_single(
        Operation::Reduce(ReduceSpec {
            kind: ReduceKind::Sum,
            axes: vec![1],
            keepdims: false,
        }),
        vec![relu],
    );
    let graph = builder.finish("dynamic", vec![sum]);

    let batch = Dimension::dynamic("batch");
    let input = TensorSpec::new(DType::F32, Shape::new(vec![batch.clone(), Dimension::Static(5)]));
    let types = propagate(&graph, &[input.clone()]).expect("propagate");
    assert_eq!(types.get(relu), Some(&input));
    let reduced = types.get(sum).expect("sum type");
    assert_eq!(reduced.shape.dims(), &[batch]);
    assert!(!reduced.is_static());
}

#[test]
fn topk_produces_values_and_i64_indices() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let outputs = builder.emit(
        Operation::TopK(TopKSpec {
            k: 2,
            axis: -1,
            largest: true,
        }),
        vec![x],
    );
    let graph = builder.finish("topk", outputs.clone());

    let types = propagate(&graph, &[f32_spec(&[3, 5])]).expect("propagate");
    assert_eq!(types.get(outputs[0]), Some(&f32_spec(&[3, 2])));
    assert_eq!(types.get(outputs[1]), Some(&TensorSpec::with_static(DType::Si64, &[3, 2])));
}

#[test]
fn mismatched_features_name_the_offending_node() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(&[2, 3], &[0.0; 6]));
    let linear_id = builder.peek_node_id();
    let y = builder.emit_single(Operation::Linear(LinearSpec { has_bias: false }), vec![x, weight]);
    let graph = builder.finish("bad-linear", vec![y]);

    let err = propagate(&graph, &[f32_spec(&[1, 4])]).expect_err("feature mismatch");
    assert_eq!(err.node, Some(linear_id));
    assert_eq!(linear_id, NodeId(1));
    assert!(err.to_string().contains("linear"), "{err}");
}

#[test]
fn traced_input_types_must_agree_with_configuration() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_input("x", f32_spec(&[1, 4]));
    let graph = builder.finish("typed", vec![x]);

    let err = propagate(&graph, &[TensorSpec::with_static(DType::Si64, &[1, 4])])
        .expect_err("dtype conflict");
    assert_eq!(err.value, Some(x));

    let err = propagate(&graph, &[f32_spec(&[1, 8])]).expect_err("extent conflict");
    assert_eq!(err.value, Some(x));
    assert!(err.message.contains("axis 1"), "{err}");

    let batch = TensorSpec::new(
        DType::F32,
        Shape::new(vec![Dimension::dynamic("batch"), Dimension::Static(4)]),
    );
    let types = propagate(&graph, &[batch.clone()]).expect("dynamic config dims are accepted");
    assert_eq!(types.get(x), Some(&batch));

    let err = propagate(&graph, &[]).expect_err("missing spec");
    assert!(err.message.contains("input specs"), "{err}");
}

#[test]
fn vector_matmul_operands_follow_numpy_rules() {
    let mut builder = GraphBuilder::new();
    let v = builder.add_untyped_input("v");
    let m = builder.add_untyped_input("m");
    let row = builder.emit_single(Operation::MatMul, vec![v, m]);
    let col = builder.emit_single(Operation::MatMul, vec![m, row]);
    let dot = builder.emit_single(Operation::MatMul, vec![row, row]);
    let graph = builder.finish("vectors", vec![col, dot]);

    let types = propagate(&graph, &[f32_spec(&[3]), f32_spec(&[3, 3])]).expect("propagate");
    assert_eq!(types.get(row), Some(&f32_spec(&[3])));
    assert_eq!(types.get(col), Some(&f32_spec(&[3])));
    assert_eq!(types.get(dot), Some(&f32_spec(&[])));

    let err = propagate(&graph, &[f32_spec(&[2]), f32_spec(&[3, 3])]).expect_err("contraction");
    assert_eq!(err.node, Some(NodeId(0)));
}
