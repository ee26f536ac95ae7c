use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, ensure, Result};
use tracing::debug;

use hylo::engine::{
    BuildConfig, DeviceBuffer, DeviceId, EngineManifest, EngineResult, EngineRuntime,
    EngineRuntimeError, ExecutionContext, NetworkDefinition, PendingExecution,
};

use crate::exec::execute_plan;
use crate::plan::{estimate_workspace, layer_kinds, EnginePlan};

pub const REF_ENGINE_NAME: &str = "ref-engine";
pub const REF_ENGINE_VERSION: &str = "ref-engine/1";

/// CPU stand-in for a device engine library. Builds validate and serialize
/// the network; execution interprets it on a worker thread per enqueue.
#[derive(Debug, Clone)]
pub struct RefEngineRuntime {
    version_tag: String,
    concurrent_builds: bool,
    devices: BTreeSet<DeviceId>,
    rejected_layers: BTreeSet<String>,
    builds: Arc<AtomicUsize>,
}

impl RefEngineRuntime {
    pub fn new() -> Self {
        Self {
            version_tag: REF_ENGINE_VERSION.to_string(),
            concurrent_builds: false,
            devices: [DeviceId::new("gpu:0"), DeviceId::new("gpu:1")].into_iter().collect(),
            rejected_layers: BTreeSet::new(),
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }

    pub fn with_concurrent_builds(mut self, enabled: bool) -> Self {
        self.concurrent_builds = enabled;
        self
    }

    pub fn with_devices<I, D>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.devices = devices.into_iter().map(DeviceId::new).collect();
        self
    }

    /// Builds containing a layer of this kind (see `LayerKind::name`) fail.
    pub fn rejecting_layer(mut self, kind: impl Into<String>) -> Self {
        self.rejected_layers.insert(kind.into());
        self
    }

    /// Number of `build` calls served so far, shared between clones.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn build_plan(&self, network: &NetworkDefinition, config: &BuildConfig) -> Result<Vec<u8>> {
        ensure!(
            self.devices.contains(&config.device),
            "device {} is not available",
            config.device
        );
        network.validate()?;
        if let Some(kind) = layer_kinds(network)
            .into_iter()
            .find(|kind| self.rejected_layers.contains(*kind))
        {
            bail!("layer kind '{kind}' is not supported by this engine");
        }
        let workspace_bytes = estimate_workspace(network)?;
        if workspace_bytes > config.workspace_limit {
            bail!(
                "insufficient workspace: plan needs {workspace_bytes} bytes, limit is {}",
                config.workspace_limit
            );
        }
        let plan = EnginePlan {
            version_tag: self.version_tag.clone(),
            device: config.device.clone(),
            precision: config.precision,
            workspace_bytes,
            network: network.clone(),
        };
        let blob = plan.encode()?;
        debug!(
            device = %config.device,
            precision = %config.precision,
            layers = network.layers().len(),
            workspace_bytes,
            bytes = blob.len(),
            "built engine plan"
        );
        Ok(blob)
    }

    fn load_plan(&self, blob: &[u8], manifest: &EngineManifest) -> Result<EnginePlan> {
        let plan = EnginePlan::decode(blob)?;
        ensure!(
            plan.version_tag == self.version_tag,
            "plan was built by {}, this runtime is {}",
            plan.version_tag,
            self.version_tag
        );
        ensure!(
            self.devices.contains(&plan.device),
            "device {} is not available",
            plan.device
        );
        plan.network.validate()?;
        let network = &plan.network;
        ensure!(
            network.inputs().len() == manifest.inputs.len()
                && network.outputs().len() == manifest.outputs.len(),
            "manifest binds {} inputs and {} outputs, plan has {} and {}",
            manifest.inputs.len(),
            manifest.outputs.len(),
            network.inputs().len(),
            network.outputs().len()
        );
        for (binding, declared) in network.inputs().iter().zip(&manifest.inputs) {
            let spec = network.tensor_spec(binding.tensor)?;
            ensure!(
                spec.dtype == declared.spec.dtype,
                "input '{}' is {} in the plan but {} in the manifest",
                declared.name,
                spec.dtype,
                declared.spec.dtype
            );
        }
        Ok(plan)
    }
}

impl Default for RefEngineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn runtime_error(err: anyhow::Error) -> EngineRuntimeError {
    EngineRuntimeError::new(format!("{err:#}"))
}

impl EngineRuntime for RefEngineRuntime {
    fn name(&self) -> &str {
        REF_ENGINE_NAME
    }

    fn version_tag(&self) -> &str {
        &self.version_tag
    }

    fn supports_concurrent_builds(&self) -> bool {
        self.concurrent_builds
    }

    fn build(&self, network: &NetworkDefinition, config: &BuildConfig) -> EngineResult<Vec<u8>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.build_plan(network, config).map_err(runtime_error)
    }

    fn load(
        &self,
        blob: &[u8],
        manifest: &EngineManifest,
    ) -> EngineResult<Box<dyn ExecutionContext>> {
        let plan = self.load_plan(blob, manifest).map_err(runtime_error)?;
        Ok(Box::new(RefExecutionContext {
            plan: Arc::new(plan),
            enqueued: 0,
        }))
    }
}

struct RefExecutionContext {
    plan: Arc<EnginePlan>,
    enqueued: usize,
}

impl ExecutionContext for RefExecutionContext {
    fn enqueue(&mut self, inputs: Vec<DeviceBuffer>) -> EngineResult<Box<dyn PendingExecution>> {
        let plan = Arc::clone(&self.plan);
        let stream = self.enqueued;
        self.enqueued += 1;
        let handle = thread::Builder::new()
            .name(format!("hylo-ref-stream-{stream}"))
            .spawn(move || execute_plan(&plan, &inputs))
            .map_err(|err| EngineRuntimeError::new(format!("failed to start stream: {err}")))?;
        Ok(Box::new(RefPending { handle }))
    }
}

struct RefPending {
    handle: JoinHandle<Result<Vec<DeviceBuffer>>>,
}

impl PendingExecution for RefPending {
    fn synchronize(self: Box<Self>) -> EngineResult<Vec<DeviceBuffer>> {
        match self.handle.join() {
            Ok(result) => result.map_err(runtime_error),
            Err(_) => Err(EngineRuntimeError::new("engine stream panicked")),
        }
    }
}
