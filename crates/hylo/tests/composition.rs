use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hylo::classify::classify_graph;
use hylo::compose::compose;
use hylo::convert::{ConstantTable, ConverterRegistry};
use hylo::engine::{
    BuildConfig, EngineArtifact, EngineManifest, EngineResult, EngineRuntime, ExecutionContext,
    IoBinding, NetworkDefinition,
};
use hylo::graph::{DType, Graph, GraphBuilder, OpKind, Operation, SoftmaxSpec, TensorSpec, UnaryOp, ValueId};
use hylo::partition::{partition, Partition, SegmentId};
use hylo::propagate::{propagate, ValueTypes};
use hylo::{BuildFailurePolicy, CompileConfig, CompileError, Compiler};
use hylo_engine_ref::RefEngineRuntime;

fn f32_spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::with_static(DType::F32, dims)
}

fn config() -> CompileConfig {
    CompileConfig::new(vec![f32_spec(&[2, 3])], BuildFailurePolicy::Abort).with_min_segment_size(1)
}

struct Fixture {
    graph: Graph,
    types: ValueTypes,
    partition: Partition,
    artifacts: HashMap<SegmentId, EngineArtifact>,
    relu: ValueId,
}

/// relu -> tanh as a single engine segment, with its real artifact.
fn fixture() -> Fixture {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let relu = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![x]);
    let tanh = builder.emit_single(Operation::Unary(UnaryOp::Tanh), vec![relu]);
    let graph = builder.finish("pair", vec![tanh]);

    let registry = ConverterRegistry::standard();
    let types = propagate(&graph, &[f32_spec(&[2, 3])]).expect("propagate");
    let classes = classify_graph(
        &graph,
        &types,
        &ConstantTable::from_graph(&graph),
        &registry,
        &BTreeSet::new(),
    );
    let partition = partition(&graph, &classes, 1).expect("partition");
    assert_eq!(partition.segments.len(), 1);

    let module = Compiler::new(Arc::new(registry), Arc::new(RefEngineRuntime::new()))
        .compile(&graph, &config())
        .expect("compile");
    let (_, artifact) = module.engines().next().expect("engine");
    let artifacts = HashMap::from([(SegmentId(0), artifact.clone())]);
    Fixture {
        graph,
        types,
        partition,
        artifacts,
        relu,
    }
}

fn compose_err(fixture: &Fixture) -> String {
    compose(&fixture.graph, &fixture.types, &fixture.partition, &fixture.artifacts)
        .expect_err("composition must fail")
        .message
}

#[test]
fn consistent_parts_compose() {
    let fixture = fixture();
    let composition = compose(&fixture.graph, &fixture.types, &fixture.partition, &fixture.artifacts)
        .expect("compose");
    assert_eq!(composition.engine_calls.len(), 1);
    assert_eq!(composition.graph.outputs, fixture.graph.outputs);
    assert!(composition.dropped.is_empty());
}

#[test]
fn manifest_arity_must_match_the_segment_boundary() {
    let mut fixture = fixture();
    fixture.partition.segments[0].outputs.push(fixture.relu);
    let message = compose_err(&fixture);
    assert!(message.contains("boundary outputs"), "{message}");
}

#[test]
fn manifest_types_must_match_the_boundary_values() {
    let mut fixture = fixture();
    let artifact = fixture.artifacts.get_mut(&SegmentId(0)).expect("artifact");
    artifact.manifest.inputs[0] = IoBinding {
        name: "input_0".to_string(),
        spec: f32_spec(&[2, 4]),
    };
    let message = compose_err(&fixture);
    assert!(message.contains("does not match the type"), "{message}");
}

#[test]
fn segment_inputs_must_come_from_outside() {
    let mut fixture = fixture();
    fixture.partition.segments[0].inputs.push(fixture.relu);
    let message = compose_err(&fixture);
    assert!(message.contains("internal value"), "{message}");
}

#[test]
fn engine_segments_need_an_artifact() {
    let mut fixture = fixture();
    fixture.artifacts.clear();
    let message = compose_err(&fixture);
    assert!(message.contains("no engine was built"), "{message}");
}

#[test]
fn values_used_before_definition_are_rejected() {
    let mut graph = fixture().graph;
    graph.nodes.swap(0, 1);

    let err = Compiler::new(
        Arc::new(ConverterRegistry::standard()),
        Arc::new(RefEngineRuntime::new()),
    )
    .compile(&graph, &config())
    .expect_err("misordered graph");
    assert!(matches!(err, CompileError::Composition(_)), "{err}");

    let classes = classify_graph(
        &graph,
        &ValueTypes::new(),
        &ConstantTable::from_graph(&graph),
        &ConverterRegistry::standard(),
        &BTreeSet::new(),
    );
    assert!(partition(&graph, &classes, 1).is_err());
}

/// Records how many builds run at once.
struct OverlapRecorder {
    inner: RefEngineRuntime,
    active: AtomicUsize,
    peak: AtomicUsize,
    concurrent: bool,
}

impl OverlapRecorder {
    fn new(concurrent: bool) -> Self {
        Self {
            inner: RefEngineRuntime::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            concurrent,
        }
    }
}

impl EngineRuntime for OverlapRecorder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version_tag(&self) -> &str {
        self.inner.version_tag()
    }

    fn supports_concurrent_builds(&self) -> bool {
        self.concurrent
    }

    fn build(&self, network: &NetworkDefinition, config: &BuildConfig) -> EngineResult<Vec<u8>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        let blob = self.inner.build(network, config);
        self.active.fetch_sub(1, Ordering::SeqCst);
        blob
    }

    fn load(&self, blob: &[u8], manifest: &EngineManifest) -> EngineResult<Box<dyn ExecutionContext>> {
        self.inner.load(blob, manifest)
    }
}

/// Four distinct engine segments separated by host-only softmax nodes.
fn striped() -> Graph {
    let mut builder = GraphBuilder::new();
    let mut y = builder.add_untyped_input("x");
    for (index, op) in [UnaryOp::Relu, UnaryOp::Tanh, UnaryOp::Sigmoid, UnaryOp::Exp]
        .into_iter()
        .enumerate()
    {
        if index > 0 {
            y = builder.emit_single(Operation::Softmax(SoftmaxSpec { axis: -1 }), vec![y]);
        }
        y = builder.emit_single(Operation::Unary(op), vec![y]);
    }
    builder.finish("striped", vec![y])
}

fn peak_builds(runtime: OverlapRecorder, config: &CompileConfig) -> usize {
    let runtime = Arc::new(runtime);
    let module = Compiler::new(
        Arc::new(ConverterRegistry::standard().without(OpKind::Softmax)),
        Arc::clone(&runtime) as Arc<dyn EngineRuntime>,
    )
    .compile(&striped(), config)
    .expect("compile");
    assert_eq!(module.engine_count(), 4);
    runtime.peak.load(Ordering::SeqCst)
}

#[test]
fn builds_on_one_device_never_overlap_without_runtime_support() {
    assert_eq!(peak_builds(OverlapRecorder::new(false), &config()), 1);
}

#[test]
fn serial_builds_setting_serializes_concurrent_runtimes() {
    assert_eq!(
        peak_builds(OverlapRecorder::new(true), &config().with_serial_builds(true)),
        1
    );
}
