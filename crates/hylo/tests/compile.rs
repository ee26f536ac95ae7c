use std::sync::Arc;

use hylo::classify::{Classification, FallbackReason};
use hylo::graph::{
    BinaryOp, DType, Dimension, DropoutSpec, Graph, GraphBuilder, LinearSpec, NodeId, OpKind,
    Operation, Shape, SoftmaxSpec, TensorLiteral, TensorSpec, UnaryOp,
};
use hylo::partition::SegmentKind;
use hylo::{compile, BuildFailurePolicy, CompileConfig, CompileError, Compiler, ConverterRegistry};
use hylo_engine_ref::RefEngineRuntime;

fn f32_spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::with_static(DType::F32, dims)
}

fn config(dims: &[usize]) -> CompileConfig {
    CompileConfig::new(vec![f32_spec(dims)], BuildFailurePolicy::Abort).with_min_segment_size(1)
}

fn compiler(registry: ConverterRegistry) -> Compiler {
    Compiler::new(Arc::new(registry), Arc::new(RefEngineRuntime::new()))
}

fn kinds(graph: &Graph) -> Vec<OpKind> {
    graph.nodes.iter().map(|node| node.kind()).collect()
}

/// x -> relu -> sigmoid -> tanh
fn unary_chain() -> (Graph, Vec<NodeId>) {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let mut ids = Vec::new();
    let mut value = x;
    for op in [UnaryOp::Relu, UnaryOp::Sigmoid, UnaryOp::Tanh] {
        ids.push(builder.peek_node_id());
        value = builder.emit_single(Operation::Unary(op), vec![value]);
    }
    (builder.finish("unary-chain", vec![value]), ids)
}

/// x -> relu -> softmax -> tanh
fn split_chain() -> (Graph, Vec<NodeId>) {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let a = builder.peek_node_id();
    let relu = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![x]);
    let s = builder.peek_node_id();
    let soft = builder.emit_single(Operation::Softmax(SoftmaxSpec { axis: -1 }), vec![relu]);
    let c = builder.peek_node_id();
    let out = builder.emit_single(Operation::Unary(UnaryOp::Tanh), vec![soft]);
    (builder.finish("split-chain", vec![out]), vec![a, s, c])
}

#[test]
fn convertible_chain_becomes_one_engine_call() {
    let (graph, ids) = unary_chain();
    let module = compiler(ConverterRegistry::standard())
        .compile(&graph, &config(&[2, 3]))
        .expect("compile");

    assert_eq!(kinds(&module.graph), vec![OpKind::EngineCall]);
    assert_eq!(module.engine_count(), 1);
    assert_eq!(module.graph.outputs, graph.outputs);

    let report = &module.report;
    assert_eq!(report.segments.len(), 1);
    assert_eq!(report.segments[0].nodes, ids);
    assert_eq!(report.segments[0].layers, Some(3));
    assert_eq!(report.build_rounds, 1);
    assert!(report.fallback_nodes().is_empty());
}

#[test]
fn unregistered_node_splits_the_chain_in_order() {
    let (graph, ids) = split_chain();
    let registry = ConverterRegistry::standard().without(OpKind::Softmax);
    let module = compiler(registry)
        .compile(&graph, &config(&[2, 3]))
        .expect("compile");

    assert_eq!(
        kinds(&module.graph),
        vec![OpKind::EngineCall, OpKind::Softmax, OpKind::EngineCall]
    );
    assert_eq!(module.graph.nodes[1].id, ids[1]);

    let report = &module.report;
    let segment_kinds = report.segments.iter().map(|s| s.kind).collect::<Vec<_>>();
    assert_eq!(
        segment_kinds,
        vec![SegmentKind::Engine, SegmentKind::Fallback, SegmentKind::Engine]
    );
    assert_eq!(report.segments[0].nodes, vec![ids[0]]);
    assert_eq!(report.segments[2].nodes, vec![ids[2]]);
    assert_eq!(
        report.classification(ids[1]),
        Some(&Classification::Fallback(FallbackReason::UnregisteredKind))
    );
    assert_eq!(report.fallback_nodes(), vec![ids[1]]);
}

#[test]
fn unresolved_dimension_falls_back_and_compile_succeeds() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(&[2, 4], &[0.5; 8]));
    let linear = builder.peek_node_id();
    let y = builder.emit_single(Operation::Linear(LinearSpec { has_bias: false }), vec![x, weight]);
    let relu = builder.peek_node_id();
    let out = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![y]);
    let graph = builder.finish("dynamic-batch", vec![out]);

    let input = TensorSpec::new(
        DType::F32,
        Shape::new(vec![Dimension::dynamic("batch"), Dimension::Static(4)]),
    );
    let config = CompileConfig::new(vec![input], BuildFailurePolicy::Abort).with_min_segment_size(1);
    let module = compiler(ConverterRegistry::standard())
        .compile(&graph, &config)
        .expect("compile");

    let report = &module.report;
    assert_eq!(
        report.nodes_with_reason(&FallbackReason::UnresolvedShape { value: x }),
        vec![linear]
    );
    assert_eq!(report.classification(relu), Some(&Classification::Convertible));
    assert_eq!(report.engine_count(), 1);
    assert!(kinds(&module.graph).contains(&OpKind::Linear));
}

#[test]
fn forced_kinds_never_reach_an_engine() {
    let (graph, ids) = unary_chain();
    let config = config(&[2, 3]).with_forced_fallback(OpKind::Unary);
    let registry = ConverterRegistry::standard();
    assert!(registry.contains(OpKind::Unary));
    let module = compiler(registry).compile(&graph, &config).expect("compile");

    assert_eq!(module.engine_count(), 0);
    assert_eq!(module.graph.nodes, graph.nodes);
    for id in ids {
        assert_eq!(module.report.classification(id), Some(&Classification::ForceFallback));
    }
}

#[test]
fn empty_registry_compiles_to_a_passthrough() {
    let (graph, ids) = split_chain();
    let module = compile(
        &graph,
        &config(&[2, 3]),
        Arc::new(ConverterRegistry::empty(0)),
        Arc::new(RefEngineRuntime::new()),
    )
    .expect("compile");

    assert_eq!(module.engine_count(), 0);
    assert_eq!(module.graph.nodes, graph.nodes);
    assert_eq!(module.report.fallback_nodes(), ids);
    assert_eq!(
        module.report.nodes_with_reason(&FallbackReason::UnregisteredKind),
        ids
    );
}

#[test]
fn small_runs_are_demoted_instead_of_built() {
    let (graph, ids) = split_chain();
    let runtime = RefEngineRuntime::new();
    let registry = ConverterRegistry::standard().without(OpKind::Softmax);
    let module = Compiler::new(Arc::new(registry), Arc::new(runtime.clone()))
        .compile(&graph, &config(&[2, 3]).with_min_segment_size(2))
        .expect("compile");

    assert_eq!(runtime.build_count(), 0);
    assert_eq!(module.engine_count(), 0);
    assert_eq!(
        module.report.nodes_with_reason(&FallbackReason::DemotedSmallSegment),
        vec![ids[0], ids[2]]
    );
}

#[test]
fn strict_conversion_surfaces_the_first_fallback() {
    let (graph, ids) = split_chain();
    let registry = ConverterRegistry::standard().without(OpKind::Softmax);
    let err = compiler(registry)
        .compile(&graph, &config(&[2, 3]).with_strict_conversion(true))
        .expect_err("softmax has no converter");
    assert_eq!(
        err,
        CompileError::UnsupportedOperator {
            node: ids[1],
            kind: OpKind::Softmax
        }
    );

    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let erf = builder.peek_node_id();
    let y = builder.emit_single(Operation::Unary(UnaryOp::Erf), vec![x]);
    let graph = builder.finish("erf", vec![y]);
    let err = compiler(ConverterRegistry::standard())
        .compile(&graph, &config(&[4]).with_strict_conversion(true))
        .expect_err("erf has no engine layer");
    assert!(matches!(
        err,
        CompileError::UnsupportedAttribute { node, kind: OpKind::Unary, .. } if node == erf
    ));

    let module = compiler(ConverterRegistry::standard())
        .compile(
            &graph,
            &config(&[4])
                .with_strict_conversion(true)
                .with_forced_fallback(OpKind::Unary),
        )
        .expect("forced fallback is not a conversion failure");
    assert_eq!(module.engine_count(), 0);
}

#[test]
fn conflicting_shapes_abort_compilation() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(&[2, 3], &[0.0; 6]));
    let y = builder.emit_single(Operation::Linear(LinearSpec { has_bias: false }), vec![x, weight]);
    let graph = builder.finish("bad", vec![y]);

    let err = compiler(ConverterRegistry::standard())
        .compile(&graph, &config(&[1, 5]))
        .expect_err("feature mismatch");
    assert!(matches!(err, CompileError::ShapeInference(_)), "{err}");
}

#[test]
fn invalid_configuration_is_rejected() {
    let (graph, _) = unary_chain();
    let compiler = compiler(ConverterRegistry::standard());

    let missing = CompileConfig::new(Vec::new(), BuildFailurePolicy::Abort);
    assert!(matches!(
        compiler.compile(&graph, &missing),
        Err(CompileError::InvalidConfig(_))
    ));

    let no_workspace = config(&[2, 3]).with_workspace_limit(0);
    assert!(matches!(
        compiler.compile(&graph, &no_workspace),
        Err(CompileError::InvalidConfig(_))
    ));

    let no_device = config(&[2, 3]).with_device("  ");
    assert!(matches!(
        compiler.compile(&graph, &no_device),
        Err(CompileError::InvalidConfig(_))
    ));
}

#[test]
fn lowering_removes_noops_and_dead_nodes() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let identity = builder.peek_node_id();
    let same = builder.emit_single(Operation::Identity, vec![x]);
    let dropout = builder.peek_node_id();
    let dropped = builder.emit_single(Operation::Dropout(DropoutSpec { p: 0.5 }), vec![same]);
    let unused = builder.peek_node_id();
    builder.emit_single(Operation::Unary(UnaryOp::Exp), vec![dropped]);
    let out = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![dropped]);
    let graph = builder.finish("lowering", vec![out]);

    let module = compiler(ConverterRegistry::empty(0))
        .compile(&graph, &config(&[3]))
        .expect("compile");
    assert_eq!(module.report.eliminated, vec![identity, dropout, unused]);
    assert_eq!(kinds(&module.graph), vec![OpKind::Unary]);
    assert_eq!(module.graph.nodes[0].inputs, vec![x]);

    let module = compiler(ConverterRegistry::empty(0))
        .compile(&graph, &config(&[3]).with_lowering(false))
        .expect("compile without lowering");
    assert!(module.report.eliminated.is_empty());
    assert_eq!(
        kinds(&module.graph),
        vec![OpKind::Identity, OpKind::Dropout, OpKind::Unary, OpKind::Unary]
    );
}

#[test]
fn host_constants_cloned_into_engines_are_dropped() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let bias = builder.peek_node_id();
    let b = builder.constant(TensorLiteral::from_f32(&[3], &[1.0, -1.0, 0.5]));
    let probs = builder.emit_single(Operation::Softmax(SoftmaxSpec { axis: -1 }), vec![x]);
    let sum = builder.emit_single(Operation::Binary(BinaryOp::Add), vec![probs, b]);
    let out = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![sum]);
    let graph = builder.finish("orphan", vec![out]);

    for lowering in [true, false] {
        let module = compiler(ConverterRegistry::standard().without(OpKind::Softmax))
            .compile(&graph, &config(&[3]).with_lowering(lowering))
            .expect("compile");
        assert_eq!(module.report.eliminated, vec![bias]);
        assert_eq!(kinds(&module.graph), vec![OpKind::Softmax, OpKind::EngineCall]);
        let (_, artifact) = module.engines().next().expect("engine");
        assert_eq!(artifact.manifest.inputs.len(), 1);
    }
}

#[test]
fn report_serializes_classifications() {
    let (graph, _) = split_chain();
    let registry = ConverterRegistry::standard().without(OpKind::Softmax);
    let module = compiler(registry)
        .compile(&graph, &config(&[2, 3]))
        .expect("compile");
    let json = module.report.to_json_string().expect("report json");
    assert!(json.contains("UnregisteredKind"), "{json}");
    assert!(json.contains("split-chain"), "{json}");
}

#[test]
fn placeholder_constants_are_frozen_into_the_engine() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let table = builder.constant(TensorLiteral::from_f32(&[3], &[1.0, 2.0, 3.0]));
    let frozen = builder.emit_single(Operation::PlaceholderConst, vec![table]);
    let sum = builder.emit_single(Operation::Binary(BinaryOp::Add), vec![x, frozen]);
    let out = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![sum]);
    let graph = builder.finish("frozen", vec![out]);

    let module = compiler(ConverterRegistry::standard())
        .compile(&graph, &config(&[3]))
        .expect("compile");
    assert_eq!(kinds(&module.graph), vec![OpKind::EngineCall]);
    let (_, artifact) = module.engines().next().expect("engine");
    assert_eq!(artifact.manifest.inputs.len(), 1);
    assert_eq!(module.graph.nodes[0].inputs, vec![x]);

    let segment = module.report.engine_segments().next().expect("engine segment");
    assert_eq!(segment.diagnostics, artifact.manifest.diagnostics);
    assert!(
        segment
            .diagnostics
            .iter()
            .any(|note| note.contains("placeholder baked as constant")),
        "{:?}",
        segment.diagnostics
    );
    assert!(module.report.to_string().contains("note: "));
}
