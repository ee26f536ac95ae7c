use hylo::engine::{
    ActivationKind, BuildConfig, DeviceBuffer, DeviceId, ElementWiseOp, EngineManifest,
    EngineRuntime, IoBinding, LayerKind, NetworkDefinition, PrecisionMode,
    ENGINE_ARTIFACT_VERSION,
};
use hylo::graph::{DType, TensorLiteral, TensorSpec};
use hylo_engine_ref::{RefEngineRuntime, REF_ENGINE_NAME, REF_ENGINE_VERSION};

fn spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::with_static(DType::F32, dims)
}

/// relu(input + 1)
fn shifted_relu(precision: PrecisionMode) -> NetworkDefinition {
    let mut network = NetworkDefinition::new();
    let input = network.add_input("input_0", spec(&[1, 4]));
    let ones = network
        .add_layer(
            "ones",
            LayerKind::Constant {
                weights: TensorLiteral::from_f32(&[1, 4], &[1.0; 4]),
            },
            &[],
            vec![spec(&[1, 4])],
            precision,
        )
        .expect("constant layer");
    let sum = network
        .add_layer(
            "add",
            LayerKind::ElementWise(ElementWiseOp::Sum),
            &[input, ones[0]],
            vec![spec(&[1, 4])],
            precision,
        )
        .expect("add layer");
    let relu = network
        .add_layer(
            "relu",
            LayerKind::Activation(ActivationKind::Relu),
            &[sum[0]],
            vec![spec(&[1, 4])],
            precision,
        )
        .expect("relu layer");
    network.mark_output("output_0", relu[0]).expect("output");
    network
}

fn build_config(precision: PrecisionMode) -> BuildConfig {
    BuildConfig {
        device: DeviceId::default(),
        precision,
        workspace_limit: 1 << 20,
    }
}

fn manifest(runtime: &RefEngineRuntime, layers: usize) -> EngineManifest {
    EngineManifest {
        artifact_version: ENGINE_ARTIFACT_VERSION,
        inputs: vec![IoBinding {
            name: "input_0".to_string(),
            spec: spec(&[1, 4]),
        }],
        outputs: vec![IoBinding {
            name: "output_0".to_string(),
            spec: spec(&[1, 4]),
        }],
        precision: PrecisionMode::Full,
        device: DeviceId::default(),
        runtime: runtime.name().to_string(),
        version_tag: runtime.version_tag().to_string(),
        built_at_unix_ms: 0,
        fingerprint: 0,
        layer_count: layers,
        diagnostics: Vec::new(),
    }
}

fn buffer(values: &[f32]) -> DeviceBuffer {
    DeviceBuffer::from_literal(&TensorLiteral::from_f32(&[1, values.len()], values)).expect("buffer")
}

fn read(buffer: &DeviceBuffer) -> Vec<f32> {
    buffer.to_literal().to_f32_vec().expect("f32 output")
}

#[test]
fn built_plan_executes_on_a_stream() {
    let runtime = RefEngineRuntime::new();
    assert_eq!(runtime.name(), REF_ENGINE_NAME);
    assert_eq!(runtime.version_tag(), REF_ENGINE_VERSION);

    let network = shifted_relu(PrecisionMode::Full);
    let blob = runtime
        .build(&network, &build_config(PrecisionMode::Full))
        .expect("build");
    assert_eq!(runtime.build_count(), 1);

    let mut context = runtime.load(&blob, &manifest(&runtime, 3)).expect("load");
    let pending = context
        .enqueue(vec![buffer(&[-3.0, -1.0, 1.0, 2.0])])
        .expect("enqueue");
    let outputs = pending.synchronize().expect("synchronize");
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].dims, vec![1, 4]);
    assert_eq!(read(&outputs[0]), vec![0.0, 0.0, 2.0, 3.0]);
}

#[test]
fn overlapping_streams_complete_independently() {
    let runtime = RefEngineRuntime::new();
    let blob = runtime
        .build(&shifted_relu(PrecisionMode::Full), &build_config(PrecisionMode::Full))
        .expect("build");
    let mut context = runtime.load(&blob, &manifest(&runtime, 3)).expect("load");

    let first = context.enqueue(vec![buffer(&[0.0, 1.0, 2.0, 3.0])]).expect("first");
    let second = context.enqueue(vec![buffer(&[-5.0, -5.0, 5.0, 5.0])]).expect("second");
    assert_eq!(read(&second.synchronize().expect("second")[0]), vec![0.0, 0.0, 6.0, 6.0]);
    assert_eq!(read(&first.synchronize().expect("first")[0]), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn reduced_precision_rounds_layer_results_to_half() {
    let runtime = RefEngineRuntime::new();
    let input = [0.0001, 1.0001, 2.0, 3.0];

    let full = runtime
        .build(&shifted_relu(PrecisionMode::Full), &build_config(PrecisionMode::Full))
        .expect("full build");
    let mut context = runtime.load(&full, &manifest(&runtime, 3)).expect("load");
    let exact = read(&context.enqueue(vec![buffer(&input)]).expect("enqueue").synchronize().expect("sync")[0]);
    assert_eq!(exact[1], 1.0001 + 1.0);

    let reduced = runtime
        .build(
            &shifted_relu(PrecisionMode::Reduced),
            &build_config(PrecisionMode::Reduced),
        )
        .expect("reduced build");
    let mut context = runtime.load(&reduced, &manifest(&runtime, 3)).expect("load");
    let rounded = read(&context.enqueue(vec![buffer(&input)]).expect("enqueue").synchronize().expect("sync")[0]);
    assert_eq!(rounded[1], 2.0);
    for (a, b) in exact.iter().zip(&rounded) {
        assert!((a - b).abs() <= 1e-2 * a.abs().max(1.0));
    }
}

#[test]
fn build_respects_the_workspace_limit() {
    let runtime = RefEngineRuntime::new();
    let config = BuildConfig {
        workspace_limit: 32,
        ..build_config(PrecisionMode::Full)
    };
    let err = runtime
        .build(&shifted_relu(PrecisionMode::Full), &config)
        .expect_err("workspace too small");
    assert!(err.message().contains("insufficient workspace"), "{err}");
}

#[test]
fn build_rejects_unknown_devices_and_layers() {
    let runtime = RefEngineRuntime::new().with_devices(["gpu:0"]);
    let config = BuildConfig {
        device: DeviceId::new("gpu:7"),
        ..build_config(PrecisionMode::Full)
    };
    let err = runtime
        .build(&shifted_relu(PrecisionMode::Full), &config)
        .expect_err("unknown device");
    assert!(err.message().contains("gpu:7"), "{err}");

    let runtime = RefEngineRuntime::new().rejecting_layer("activation");
    let err = runtime
        .build(&shifted_relu(PrecisionMode::Full), &build_config(PrecisionMode::Full))
        .expect_err("rejected layer");
    assert!(err.message().contains("activation"), "{err}");
}

#[test]
fn load_refuses_plans_from_another_version() {
    let old = RefEngineRuntime::new().with_version_tag("ref-engine/0");
    let blob = old
        .build(&shifted_relu(PrecisionMode::Full), &build_config(PrecisionMode::Full))
        .expect("build");

    let current = RefEngineRuntime::new();
    let err = match current.load(&blob, &manifest(&current, 3)) {
        Ok(_) => panic!("stale plan loaded"),
        Err(err) => err,
    };
    assert!(err.message().contains("ref-engine/0"), "{err}");

    let err = match current.load(b"not a plan", &manifest(&current, 3)) {
        Ok(_) => panic!("garbage loaded"),
        Err(err) => err,
    };
    assert!(err.message().contains("not a reference engine plan"), "{err}");
}

#[test]
fn enqueue_with_wrong_inputs_fails_at_synchronize() {
    let runtime = RefEngineRuntime::new();
    let blob = runtime
        .build(&shifted_relu(PrecisionMode::Full), &build_config(PrecisionMode::Full))
        .expect("build");
    let mut context = runtime.load(&blob, &manifest(&runtime, 3)).expect("load");
    let pending = context.enqueue(vec![buffer(&[1.0, 2.0])]).expect("enqueue");
    let err = pending.synchronize().expect_err("shape mismatch");
    assert!(err.message().contains("input_0"), "{err}");
}
