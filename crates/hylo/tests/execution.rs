use std::collections::BTreeMap;
use std::sync::Arc;

use hylo::graph::{
    Conv2dSpec, CustomSpec, DType, Dimension, FlattenSpec, Graph, GraphBuilder, LinearSpec, Node,
    NodeId, OpKind, Operation, Pool2dSpec, Shape, SoftmaxSpec, TensorLiteral, TensorSpec, UnaryOp,
};
use hylo::runtime::{ExecutionErrorKind, HostError, HostInterpreter, HostResult};
use hylo::{
    BuildFailurePolicy, CompileConfig, CompiledModule, Compiler, ConverterRegistry, ModuleState,
    PrecisionMode,
};
use hylo_backend_ref_cpu::{CpuInterpreter, CpuKernelInterceptor, CpuTensor, GenericCpuInterpreter};
use hylo_engine_ref::RefEngineRuntime;

fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 37 % 17) as f32 - 8.0) * scale)
        .collect()
}

fn compile_with(graph: &Graph, registry: ConverterRegistry, config: &CompileConfig) -> CompiledModule {
    Compiler::new(Arc::new(registry), Arc::new(RefEngineRuntime::new()))
        .compile(graph, config)
        .expect("compile")
}

fn run_once<H: HostInterpreter>(module: CompiledModule, host: H, inputs: &[H::Tensor]) -> Vec<H::Tensor> {
    let mut loaded = module
        .load(Arc::new(host), &RefEngineRuntime::new())
        .expect("load");
    let outputs = loaded.run(inputs).expect("run");
    assert_eq!(loaded.state(), ModuleState::Completed);
    outputs
}

fn assert_close(expected: &[f32], actual: &[f32], tolerance: f32) {
    assert_eq!(expected.len(), actual.len());
    for (index, (a, b)) in expected.iter().zip(actual).enumerate() {
        assert!(
            (a - b).abs() <= tolerance * a.abs().max(1.0),
            "element {index}: {a} vs {b}"
        );
    }
}

/// conv -> relu -> maxpool -> flatten -> linear -> softmax -> tanh
fn classifier() -> Graph {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("image");
    let conv_w = builder.constant(TensorLiteral::from_f32(&[4, 3, 3, 3], &ramp(108, 0.05)));
    let conv_b = builder.constant(TensorLiteral::from_f32(&[4], &[0.1, -0.2, 0.3, 0.0]));
    let conv = builder.emit_single(
        Operation::Conv2d(Conv2dSpec {
            padding: [1, 1],
            has_bias: true,
            ..Conv2dSpec::default()
        }),
        vec![x, conv_w, conv_b],
    );
    let relu = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![conv]);
    let pooled = builder.emit_single(Operation::MaxPool2d(Pool2dSpec::square(2, 2, 0)), vec![relu]);
    let flat = builder.emit_single(
        Operation::Flatten(FlattenSpec {
            start_axis: 1,
            end_axis: -1,
        }),
        vec![pooled],
    );
    let fc_w = builder.constant(TensorLiteral::from_f32(&[5, 36], &ramp(180, 0.02)));
    let fc_b = builder.constant(TensorLiteral::from_f32(&[5], &[0.0, 0.5, -0.5, 1.0, -1.0]));
    let logits = builder.emit_single(
        Operation::Linear(LinearSpec { has_bias: true }),
        vec![flat, fc_w, fc_b],
    );
    let probs = builder.emit_single(Operation::Softmax(SoftmaxSpec { axis: -1 }), vec![logits]);
    let out = builder.emit_single(Operation::Unary(UnaryOp::Tanh), vec![probs]);
    builder.finish("classifier", vec![out, logits])
}

fn classifier_config() -> CompileConfig {
    CompileConfig::new(
        vec![TensorSpec::with_static(DType::F32, &[2, 3, 6, 6])],
        BuildFailurePolicy::Abort,
    )
    .with_min_segment_size(1)
}

fn image() -> CpuTensor {
    CpuTensor::from_f32(&[2, 3, 6, 6], ramp(216, 0.1)).expect("image")
}

fn f32s(tensor: &CpuTensor) -> Vec<f32> {
    tensor.as_f32().expect("f32 tensor").to_vec()
}

#[test]
fn hybrid_module_matches_host_only_execution() {
    let graph = classifier();
    let hybrid = compile_with(
        &graph,
        ConverterRegistry::standard().without(OpKind::Softmax),
        &classifier_config(),
    );
    assert_eq!(hybrid.engine_count(), 2);
    let host_only = compile_with(&graph, ConverterRegistry::empty(0), &classifier_config());
    assert_eq!(host_only.engine_count(), 0);

    let expected = run_once(host_only, CpuInterpreter::new(), &[image()]);
    let actual = run_once(hybrid, CpuInterpreter::new(), &[image()]);
    assert_eq!(actual.len(), 2);
    for (want, got) in expected.iter().zip(&actual) {
        assert_eq!(want.spec, got.spec);
        assert_close(&f32s(want), &f32s(got), 1e-5);
    }
}

#[test]
fn reduced_precision_stays_within_tolerance() {
    let graph = classifier();
    let registry = || ConverterRegistry::standard().without(OpKind::Softmax);
    let full = compile_with(&graph, registry(), &classifier_config());
    let reduced = compile_with(
        &graph,
        registry(),
        &classifier_config().with_precision(PrecisionMode::Reduced),
    );
    assert_eq!(reduced.report.precision, PrecisionMode::Reduced);

    let exact = run_once(full, CpuInterpreter::new(), &[image()]);
    let approx = run_once(reduced, CpuInterpreter::new(), &[image()]);
    for (want, got) in exact.iter().zip(&approx) {
        assert_close(&f32s(want), &f32s(got), 1e-2);
    }
}

#[test]
fn dynamic_batch_runs_with_any_extent() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(&[2, 4], &ramp(8, 0.25)));
    let y = builder.emit_single(Operation::Linear(LinearSpec { has_bias: false }), vec![x, weight]);
    let relu = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![y]);
    let out = builder.emit_single(Operation::Unary(UnaryOp::Sigmoid), vec![relu]);
    let graph = builder.finish("dynamic", vec![out]);

    let input = TensorSpec::new(
        DType::F32,
        Shape::new(vec![Dimension::dynamic("batch"), Dimension::Static(4)]),
    );
    let config = CompileConfig::new(vec![input], BuildFailurePolicy::Abort).with_min_segment_size(1);
    let module = compile_with(&graph, ConverterRegistry::standard(), &config);
    assert_eq!(module.engine_count(), 1);

    let mut loaded = module
        .load(Arc::new(CpuInterpreter::new()), &RefEngineRuntime::new())
        .expect("load");
    for batch in [1, 3] {
        let x = CpuTensor::from_f32(&[batch, 4], ramp(batch * 4, 0.5)).expect("input");
        let outputs = loaded.run(&[x]).expect("run");
        assert_eq!(outputs[0].dims().expect("dims"), vec![batch, 2]);
        assert!(f32s(&outputs[0]).iter().all(|v| (0.5..=1.0).contains(v)));
    }
}

#[test]
fn bad_inputs_are_rejected_before_execution() {
    let graph = classifier();
    let module = compile_with(&graph, ConverterRegistry::standard(), &classifier_config());
    let mut loaded = module
        .load(Arc::new(CpuInterpreter::new()), &RefEngineRuntime::new())
        .expect("load");

    let err = loaded.run(&[]).expect_err("no inputs");
    assert_eq!(
        err.kind,
        ExecutionErrorKind::InputArity {
            expected: 1,
            found: 0
        }
    );

    let small = CpuTensor::from_f32(&[1, 3, 6, 6], ramp(108, 0.1)).expect("tensor");
    let err = loaded.run(&[small]).expect_err("wrong batch");
    assert!(matches!(err.kind, ExecutionErrorKind::InputMismatch { index: 0, .. }));
    assert_eq!(loaded.state(), ModuleState::Loaded);

    loaded.run(&[image()]).expect("valid inputs still run");
    assert_eq!(loaded.state(), ModuleState::Completed);
}

/// relu -> custom "double" -> sigmoid
fn with_custom_op() -> (Graph, NodeId) {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let relu = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![x]);
    let custom = builder.peek_node_id();
    let doubled = builder.emit_single(
        Operation::Custom(CustomSpec {
            target: "double".to_string(),
            attrs: BTreeMap::new(),
            outputs: vec![TensorSpec::with_static(DType::F32, &[4])],
        }),
        vec![relu],
    );
    let out = builder.emit_single(Operation::Unary(UnaryOp::Sigmoid), vec![doubled]);
    (builder.finish("custom", vec![out]), custom)
}

struct Doubler;

impl CpuKernelInterceptor for Doubler {
    fn try_execute(
        &self,
        node: &Node,
        inputs: &[CpuTensor],
        _outputs: &[TensorSpec],
    ) -> Option<HostResult<Vec<CpuTensor>>> {
        let Operation::Custom(spec) = &node.op else {
            return None;
        };
        if spec.target != "double" {
            return None;
        }
        let values = inputs[0].as_f32()?.iter().map(|v| v * 2.0).collect();
        Some(CpuTensor::from_f32(&[4], values).map(|tensor| vec![tensor]))
    }
}

#[test]
fn host_failure_leaves_the_module_failed() {
    let (graph, custom) = with_custom_op();
    let config = CompileConfig::new(
        vec![TensorSpec::with_static(DType::F32, &[4])],
        BuildFailurePolicy::Abort,
    )
    .with_min_segment_size(1);
    let module = compile_with(&graph, ConverterRegistry::standard(), &config);
    assert_eq!(module.engine_count(), 2);

    let input = CpuTensor::from_f32(&[4], vec![-1.0, 0.0, 1.0, 2.0]).expect("input");
    let mut loaded = module
        .clone()
        .load(Arc::new(CpuInterpreter::new()), &RefEngineRuntime::new())
        .expect("load");
    let err = loaded.run(&[input.clone()]).expect_err("no kernel for custom op");
    assert_eq!(err.node, Some(custom));
    assert!(matches!(
        err.kind,
        ExecutionErrorKind::Host(HostError::Unimplemented { .. })
    ));
    assert_eq!(loaded.state(), ModuleState::Failed);

    let err = loaded.run(&[input.clone()]).expect_err("failed is terminal");
    assert_eq!(err.kind, ExecutionErrorKind::NotReady(ModuleState::Failed));

    let outputs = run_once(module, GenericCpuInterpreter::with_interceptor(Doubler), &[input]);
    let expected = [0.0f32, 0.0, 2.0, 4.0]
        .iter()
        .map(|v| 1.0 / (1.0 + (-v).exp()))
        .collect::<Vec<_>>();
    assert_close(&expected, &f32s(&outputs[0]), 1e-6);
}

#[test]
fn vector_matmuls_match_between_engine_and_host() {
    let mut builder = GraphBuilder::new();
    let v = builder.add_untyped_input("v");
    let m = builder.add_untyped_input("m");
    let mat = builder.constant(TensorLiteral::from_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    let ones = builder.constant(TensorLiteral::from_f32(&[3], &[1.0, 1.0, 1.0]));
    let row = builder.emit_single(Operation::MatMul, vec![v, mat]);
    let col = builder.emit_single(Operation::MatMul, vec![m, ones]);
    let graph = builder.finish("vector-matmul", vec![row, col]);

    let config = CompileConfig::new(
        vec![
            TensorSpec::with_static(DType::F32, &[3]),
            TensorSpec::with_static(DType::F32, &[2, 3]),
        ],
        BuildFailurePolicy::Abort,
    )
    .with_min_segment_size(1);
    let hybrid = compile_with(&graph, ConverterRegistry::standard(), &config);
    assert_eq!(hybrid.engine_count(), 1);
    let host_only = compile_with(&graph, ConverterRegistry::empty(0), &config);

    let inputs = || {
        vec![
            CpuTensor::from_f32(&[3], vec![1.0, 0.0, -1.0]).expect("v"),
            CpuTensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("m"),
        ]
    };
    let expected = run_once(host_only, CpuInterpreter::new(), &inputs());
    let actual = run_once(hybrid, CpuInterpreter::new(), &inputs());
    assert_eq!(f32s(&expected[0]), vec![-4.0, -4.0]);
    assert_eq!(f32s(&expected[1]), vec![6.0, 15.0]);
    for (want, got) in expected.iter().zip(&actual) {
        assert_eq!(want.spec, got.spec);
        assert_eq!(f32s(want), f32s(got));
    }
}
