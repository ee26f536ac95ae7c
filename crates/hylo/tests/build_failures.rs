use std::sync::Arc;

use hylo::classify::{Classification, FallbackReason};
use hylo::graph::{
    Conv2dSpec, DType, Graph, GraphBuilder, LinearSpec, NodeId, OpKind, Operation, SoftmaxSpec,
    TensorLiteral, TensorSpec, UnaryOp,
};
use hylo::partition::SegmentId;
use hylo::{
    BuildFailurePolicy, CompileConfig, CompileError, Compiler, ConverterRegistry, ModuleState,
    PrecisionMode,
};
use hylo_backend_ref_cpu::{CpuInterpreter, CpuTensor};
use hylo_engine_ref::RefEngineRuntime;

struct ConvNet {
    graph: Graph,
    weight: NodeId,
    conv: NodeId,
    relu: NodeId,
    tail: Vec<NodeId>,
}

/// conv -> relu -> softmax -> tanh -> sigmoid, with softmax left unregistered.
fn conv_net() -> ConvNet {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.peek_node_id();
    let w = builder.constant(TensorLiteral::from_f32(&[2, 1, 1, 1], &[0.5, -2.0]));
    let conv = builder.peek_node_id();
    let y = builder.emit_single(Operation::Conv2d(Conv2dSpec::default()), vec![x, w]);
    let relu = builder.peek_node_id();
    let y = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![y]);
    let y = builder.emit_single(Operation::Softmax(SoftmaxSpec { axis: 1 }), vec![y]);
    let tanh = builder.peek_node_id();
    let y = builder.emit_single(Operation::Unary(UnaryOp::Tanh), vec![y]);
    let sigmoid = builder.peek_node_id();
    let y = builder.emit_single(Operation::Unary(UnaryOp::Sigmoid), vec![y]);
    ConvNet {
        graph: builder.finish("conv-net", vec![y]),
        weight,
        conv,
        relu,
        tail: vec![tanh, sigmoid],
    }
}

fn registry() -> Arc<ConverterRegistry> {
    Arc::new(ConverterRegistry::standard().without(OpKind::Softmax))
}

fn config(policy: BuildFailurePolicy) -> CompileConfig {
    CompileConfig::new(vec![TensorSpec::with_static(DType::F32, &[1, 1, 2, 2])], policy)
        .with_min_segment_size(1)
}

fn input() -> CpuTensor {
    CpuTensor::from_f32(&[1, 1, 2, 2], vec![1.0, -1.0, 2.0, 0.0]).expect("input")
}

#[test]
fn abort_returns_the_first_failed_segment() {
    let net = conv_net();
    let runtime = RefEngineRuntime::new().rejecting_layer("convolution");
    let err = Compiler::new(registry(), Arc::new(runtime))
        .compile(&net.graph, &config(BuildFailurePolicy::Abort))
        .expect_err("convolution is rejected");

    let CompileError::EngineBuild(err) = err else {
        panic!("expected an engine build error, got {err}");
    };
    assert_eq!(err.segment, SegmentId(0));
    assert_eq!(err.nodes, vec![net.weight, net.conv, net.relu]);
    assert!(err.message.contains("convolution"), "{}", err.message);
}

#[test]
fn fallback_policy_demotes_and_repartitions() {
    let net = conv_net();
    let runtime = RefEngineRuntime::new().rejecting_layer("convolution");
    let module = Compiler::new(registry(), Arc::new(runtime.clone()))
        .compile(&net.graph, &config(BuildFailurePolicy::FallbackAndContinue))
        .expect("compile continues");

    let report = &module.report;
    assert_eq!(report.build_rounds, 2);
    assert_eq!(report.engine_count(), 1);
    for node in [net.weight, net.conv, net.relu] {
        assert!(matches!(
            report.classification(node),
            Some(Classification::Fallback(FallbackReason::EngineBuildFailed(message)))
                if message.contains("convolution")
        ));
    }
    let engine = report.engine_segments().next().expect("tail engine");
    assert_eq!(engine.nodes, net.tail);
    // The tail built in the first round and is reused in the second.
    assert!(engine.cached);
    assert_eq!(runtime.build_count(), 2);

    let host_only = Compiler::new(Arc::new(ConverterRegistry::empty(0)), Arc::new(RefEngineRuntime::new()))
        .compile(&net.graph, &config(BuildFailurePolicy::Abort))
        .expect("host only");
    let host = Arc::new(CpuInterpreter::new());
    let mut hybrid = module.load(Arc::clone(&host), &runtime).expect("load hybrid");
    let mut baseline = host_only.load(host, &runtime).expect("load baseline");
    let got = hybrid.run(&[input()]).expect("hybrid run");
    let want = baseline.run(&[input()]).expect("baseline run");
    assert_eq!(hybrid.state(), ModuleState::Completed);
    for (a, b) in want[0].as_f32().expect("f32").iter().zip(got[0].as_f32().expect("f32")) {
        assert!((a - b).abs() <= 1e-6, "{a} vs {b}");
    }
}

#[test]
fn exhausted_workspace_degrades_to_host_execution() {
    let net = conv_net();
    let module = Compiler::new(registry(), Arc::new(RefEngineRuntime::new()))
        .compile(
            &net.graph,
            &config(BuildFailurePolicy::FallbackAndContinue).with_workspace_limit(8),
        )
        .expect("compile continues");
    assert_eq!(module.engine_count(), 0);
    assert_eq!(module.report.build_rounds, 2);
    assert_eq!(module.graph.nodes, net.graph.nodes);
}

#[test]
fn recompiling_reuses_cached_engines() {
    let net = conv_net();
    let runtime = RefEngineRuntime::new();
    let compiler = Compiler::new(registry(), Arc::new(runtime.clone()));
    let config = config(BuildFailurePolicy::Abort);

    let first = compiler.compile(&net.graph, &config).expect("first compile");
    assert_eq!(runtime.build_count(), 2);
    assert!(first.report.engine_segments().all(|segment| !segment.cached));

    let second = compiler.compile(&net.graph, &config).expect("second compile");
    assert_eq!(runtime.build_count(), 2);
    assert!(second.report.engine_segments().all(|segment| segment.cached));
    assert_eq!(first.graph, second.graph);

    compiler
        .compile(&net.graph, &config.clone().with_precision(PrecisionMode::Reduced))
        .expect("reduced compile");
    assert_eq!(runtime.build_count(), 4);

    compiler
        .compile(
            &net.graph,
            &config.with_precision_override(net.tail[0], PrecisionMode::Reduced),
        )
        .expect("override compile");
    assert_eq!(runtime.build_count(), 5);
}

#[test]
fn build_errors_carry_conversion_notes() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(&[2, 2], &[1.0, 0.0, 0.0, 1.0]));
    let y = builder.emit_single(Operation::Linear(LinearSpec { has_bias: false }), vec![x, weight]);
    let y = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![y]);
    let graph = builder.finish("linear", vec![y]);

    let config = CompileConfig::new(
        vec![TensorSpec::with_static(DType::F32, &[1, 2])],
        BuildFailurePolicy::Abort,
    )
    .with_min_segment_size(1);
    let runtime = RefEngineRuntime::new().rejecting_layer("matrix_multiply");
    let err = Compiler::new(Arc::new(ConverterRegistry::standard()), Arc::new(runtime))
        .compile(&graph, &config)
        .expect_err("matrix multiply is rejected");
    let CompileError::EngineBuild(err) = err else {
        panic!("expected an engine build error, got {err}");
    };
    assert!(err.message.contains("conversion notes"), "{}", err.message);
    assert!(err.message.contains("baked as weights"), "{}", err.message);
}
