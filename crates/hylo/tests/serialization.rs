use std::sync::Arc;

use hylo::graph::{
    DType, Graph, GraphBuilder, LinearSpec, OpKind, Operation, SoftmaxSpec, TensorLiteral,
    TensorSpec, UnaryOp,
};
use hylo::runtime::ExecutionErrorKind;
use hylo::{
    BuildFailurePolicy, CompileConfig, CompiledModule, Compiler, ConverterRegistry,
    ModuleSerdeError,
};
use hylo_backend_ref_cpu::{CpuInterpreter, CpuTensor};
use hylo_engine_ref::RefEngineRuntime;

/// linear -> relu -> softmax -> tanh, softmax on the host
fn mlp() -> Graph {
    let mut builder = GraphBuilder::new();
    let x = builder.add_untyped_input("x");
    let weight = builder.constant(TensorLiteral::from_f32(
        &[3, 4],
        &[0.1, -0.2, 0.3, 0.4, 0.5, 0.6, -0.7, 0.8, 0.9, 1.0, 1.1, -1.2],
    ));
    let bias = builder.constant(TensorLiteral::from_f32(&[3], &[0.25, -0.5, 0.75]));
    let y = builder.emit_single(
        Operation::Linear(LinearSpec { has_bias: true }),
        vec![x, weight, bias],
    );
    let y = builder.emit_single(Operation::Unary(UnaryOp::Relu), vec![y]);
    let y = builder.emit_single(Operation::Softmax(SoftmaxSpec { axis: -1 }), vec![y]);
    let y = builder.emit_single(Operation::Unary(UnaryOp::Tanh), vec![y]);
    builder.finish("mlp", vec![y])
}

fn compile(runtime: RefEngineRuntime) -> CompiledModule {
    let config = CompileConfig::new(
        vec![TensorSpec::with_static(DType::F32, &[2, 4])],
        BuildFailurePolicy::Abort,
    )
    .with_min_segment_size(1);
    Compiler::new(
        Arc::new(ConverterRegistry::standard().without(OpKind::Softmax)),
        Arc::new(runtime),
    )
    .compile(&mlp(), &config)
    .expect("compile")
}

fn run(module: CompiledModule) -> Vec<CpuTensor> {
    let input = CpuTensor::from_f32(&[2, 4], vec![1.0, 2.0, -3.0, 0.5, -1.0, 0.25, 4.0, 2.0])
        .expect("input");
    let mut loaded = module
        .load(Arc::new(CpuInterpreter::new()), &RefEngineRuntime::new())
        .expect("load");
    loaded.run(&[input]).expect("run")
}

fn bits(outputs: &[CpuTensor]) -> Vec<Vec<u32>> {
    outputs
        .iter()
        .map(|tensor| {
            tensor
                .as_f32()
                .expect("f32 output")
                .iter()
                .map(|value| value.to_bits())
                .collect()
        })
        .collect()
}

#[test]
fn json_round_trip_preserves_outputs_bit_for_bit() {
    let module = compile(RefEngineRuntime::new());
    assert_eq!(module.engine_count(), 2);
    let json = module.to_json_string().expect("to json");
    let restored = CompiledModule::from_json_str(&json, &RefEngineRuntime::new()).expect("from json");
    assert_eq!(restored, module);
    assert_eq!(bits(&run(restored)), bits(&run(module)));
}

#[test]
fn bincode_round_trip_preserves_outputs_bit_for_bit() {
    let module = compile(RefEngineRuntime::new());
    let bytes = module.to_bincode_bytes().expect("to bincode");
    let restored =
        CompiledModule::from_bincode_slice(&bytes, &RefEngineRuntime::new()).expect("from bincode");
    assert_eq!(restored, module);
    assert_eq!(bits(&run(restored)), bits(&run(module)));
}

#[test]
fn modules_survive_a_trip_through_the_filesystem() {
    let module = compile(RefEngineRuntime::new());
    let dir = std::env::temp_dir().join(format!("hylo-serialization-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");

    let json_path = dir.join("mlp.json");
    module.save_json(&json_path).expect("save json");
    let from_json = CompiledModule::load_json(&json_path, &RefEngineRuntime::new()).expect("load json");

    let bin_path = dir.join("mlp.bin");
    module.save_bincode(&bin_path).expect("save bincode");
    let from_bin =
        CompiledModule::load_bincode(&bin_path, &RefEngineRuntime::new()).expect("load bincode");

    std::fs::remove_dir_all(&dir).ok();
    assert_eq!(from_json, module);
    assert_eq!(from_bin, module);
}

#[test]
fn artifacts_from_another_engine_version_are_rejected() {
    let module = compile(RefEngineRuntime::new().with_version_tag("ref-engine/0"));
    let json = module.to_json_string().expect("to json");

    let err = CompiledModule::from_json_str(&json, &RefEngineRuntime::new())
        .expect_err("stale artifact");
    let ModuleSerdeError::IncompatibleArtifact(incompatible) = err else {
        panic!("expected an incompatible artifact error, got {err}");
    };
    assert_eq!(incompatible.found, "ref-engine/0");
    assert_eq!(incompatible.expected, "ref-engine/1");

    let bytes = module.to_bincode_bytes().expect("to bincode");
    assert!(matches!(
        CompiledModule::from_bincode_slice(&bytes, &RefEngineRuntime::new()),
        Err(ModuleSerdeError::IncompatibleArtifact(_))
    ));

    let err = match module.load(Arc::new(CpuInterpreter::new()), &RefEngineRuntime::new()) {
        Ok(_) => panic!("stale module loaded"),
        Err(err) => err,
    };
    assert!(matches!(err.kind, ExecutionErrorKind::Incompatible(_)));
}

#[test]
fn unknown_format_versions_are_rejected() {
    let mut module = compile(RefEngineRuntime::new());
    module.format_version = "hylo.module.v0".to_string();
    let json = module.to_json_string().expect("to json");
    assert!(matches!(
        CompiledModule::from_json_str(&json, &RefEngineRuntime::new()),
        Err(ModuleSerdeError::FormatVersionMismatch { .. })
    ));
}
