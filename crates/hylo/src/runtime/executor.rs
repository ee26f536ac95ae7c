use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::values::{compute_last_use, first_missing_operand, DenseValueStore, Slot};
use super::{ExecutionError, ExecutionErrorKind, HostError, HostInterpreter};
use crate::engine::{DeviceBuffer, EngineRuntime, EngineRuntimeError, ExecutionContext, PendingExecution};
use crate::graph::{Graph, Node, NodeId, Operation, TensorSpec, ValueId};
use crate::module::CompiledModule;
use crate::propagate::ValueTypes;

/// Lifecycle of a loaded module. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Loaded,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Loaded => f.write_str("loaded"),
            ModuleState::Executing => f.write_str("executing"),
            ModuleState::Completed => f.write_str("completed"),
            ModuleState::Failed => f.write_str("failed"),
        }
    }
}

/// A compiled module bound to a host interpreter and to execution contexts
/// for each of its engines.
pub struct LoadedModule<H: HostInterpreter> {
    module: CompiledModule,
    host: Arc<H>,
    engines: HashMap<NodeId, Box<dyn ExecutionContext>>,
    last_use: Vec<Option<usize>>,
    state: ModuleState,
}

impl<H: HostInterpreter> LoadedModule<H> {
    /// Deserializes every embedded engine through `runtime`.
    pub fn load(
        module: CompiledModule,
        host: Arc<H>,
        runtime: &dyn EngineRuntime,
    ) -> Result<Self, ExecutionError> {
        module
            .check_compatible(runtime)
            .map_err(|err| ExecutionError::at(err.node, ExecutionErrorKind::Incompatible(err)))?;

        let mut engines = HashMap::new();
        for (node, artifact) in module.engines() {
            let context = runtime
                .load(&artifact.blob, &artifact.manifest)
                .map_err(|err| ExecutionError::at(node, ExecutionErrorKind::Engine(err)))?;
            engines.insert(node, context);
        }
        let last_use = compute_last_use(&module.graph);
        info!(
            graph = %module.graph.name,
            engines = engines.len(),
            host = host.name(),
            runtime = runtime.name(),
            "loaded module"
        );
        Ok(Self {
            module,
            host,
            engines,
            last_use,
            state: ModuleState::Loaded,
        })
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Runs the module once. Outputs are returned in graph output order, and
    /// on any failure no outputs are returned and the module becomes `Failed`.
    pub fn run(&mut self, inputs: &[H::Tensor]) -> Result<Vec<H::Tensor>, ExecutionError> {
        match self.state {
            ModuleState::Loaded | ModuleState::Completed => {}
            state => return Err(ExecutionError::new(ExecutionErrorKind::NotReady(state))),
        }
        self.check_inputs(inputs)?;

        self.state = ModuleState::Executing;
        let mut run = Run {
            graph: &self.module.graph,
            types: &self.module.types,
            host: self.host.as_ref(),
            engines: &mut self.engines,
            last_use: &self.last_use,
            store: DenseValueStore::new(&self.module.graph),
            pending: HashMap::new(),
            next_group: 0,
        };
        let result = run.execute(inputs);
        self.state = match result {
            Ok(_) => ModuleState::Completed,
            Err(_) => ModuleState::Failed,
        };
        result
    }

    fn check_inputs(&self, inputs: &[H::Tensor]) -> Result<(), ExecutionError> {
        let expected = &self.module.input_specs;
        if inputs.len() != expected.len() {
            return Err(ExecutionError::new(ExecutionErrorKind::InputArity {
                expected: expected.len(),
                found: inputs.len(),
            }));
        }
        for (index, (tensor, expected)) in inputs.iter().zip(expected).enumerate() {
            let found = self.host.spec_of(tensor);
            if !spec_admits(expected, &found) {
                return Err(ExecutionError::new(ExecutionErrorKind::InputMismatch {
                    index,
                    expected: expected.clone(),
                    found,
                }));
            }
        }
        Ok(())
    }
}

fn spec_admits(expected: &TensorSpec, found: &TensorSpec) -> bool {
    expected.dtype == found.dtype
        && found
            .shape
            .static_dims()
            .is_some_and(|dims| expected.shape.admits(&dims))
}

struct Run<'a, H: HostInterpreter> {
    graph: &'a Graph,
    types: &'a ValueTypes,
    host: &'a H,
    engines: &'a mut HashMap<NodeId, Box<dyn ExecutionContext>>,
    last_use: &'a [Option<usize>],
    store: DenseValueStore<H::Tensor>,
    pending: HashMap<usize, (NodeId, Box<dyn PendingExecution>)>,
    next_group: usize,
}

impl<H: HostInterpreter> Run<'_, H> {
    fn execute(&mut self, inputs: &[H::Tensor]) -> Result<Vec<H::Tensor>, ExecutionError> {
        let graph = self.graph;
        for (input, tensor) in graph.inputs.iter().zip(inputs) {
            self.store.insert(input.value, Slot::Host(tensor.clone()));
        }

        for (position, node) in graph.nodes.iter().enumerate() {
            if let Some(value) = first_missing_operand(node, &self.store) {
                return Err(ExecutionError::at(
                    node.id,
                    ExecutionErrorKind::MissingValue(value),
                ));
            }
            match &node.op {
                Operation::EngineCall(_) => self.enqueue_engine(node)?,
                _ => self.execute_host(node)?,
            }
            self.release_after(position, node);
        }

        let mut outputs = Vec::with_capacity(graph.outputs.len());
        for value in &graph.outputs {
            outputs.push(self.host_value(*value, None)?);
        }
        self.drain()?;
        Ok(outputs)
    }

    fn enqueue_engine(&mut self, node: &Node) -> Result<(), ExecutionError> {
        let mut buffers = Vec::with_capacity(node.inputs.len());
        for value in &node.inputs {
            buffers.push(self.device_value(*value, node.id)?);
        }
        let context = self.engines.get_mut(&node.id).ok_or_else(|| {
            ExecutionError::at(
                node.id,
                ExecutionErrorKind::Engine(EngineRuntimeError::new("engine was not loaded")),
            )
        })?;
        let handle = context
            .enqueue(buffers)
            .map_err(|err| ExecutionError::at(node.id, ExecutionErrorKind::Engine(err)))?;

        let group = self.next_group;
        self.next_group += 1;
        self.pending.insert(group, (node.id, handle));
        for (index, value) in node.outputs.iter().enumerate() {
            self.store.insert(*value, Slot::Pending { group, index });
        }
        debug!(node = %node.id, group, "enqueued engine");
        Ok(())
    }

    fn execute_host(&mut self, node: &Node) -> Result<(), ExecutionError> {
        let mut operands = Vec::with_capacity(node.inputs.len());
        for value in &node.inputs {
            operands.push(self.host_value(*value, Some(node.id))?);
        }
        let specs = node
            .outputs
            .iter()
            .map(|value| {
                self.types.get(*value).cloned().ok_or_else(|| {
                    ExecutionError::at(node.id, ExecutionErrorKind::MissingValue(*value))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let results = self
            .host
            .execute_node(node, &operands, &specs)
            .map_err(|err| ExecutionError::at(node.id, ExecutionErrorKind::Host(err)))?;
        if results.len() != node.outputs.len() {
            return Err(ExecutionError::at(
                node.id,
                ExecutionErrorKind::Host(HostError::execution(format!(
                    "{} produced {} results, expected {}",
                    node.kind(),
                    results.len(),
                    node.outputs.len()
                ))),
            ));
        }
        for (value, tensor) in node.outputs.iter().zip(results) {
            self.store.insert(*value, Slot::Host(tensor));
        }
        Ok(())
    }

    /// Host view of `value`, synchronizing and downloading engine results on demand.
    fn host_value(&mut self, value: ValueId, consumer: Option<NodeId>) -> Result<H::Tensor, ExecutionError> {
        let tag = |kind: ExecutionErrorKind| match consumer {
            Some(node) => ExecutionError::at(node, kind),
            None => ExecutionError::new(kind),
        };
        if let Some(Slot::Pending { group, .. }) = self.store.get(value) {
            let group = *group;
            self.synchronize(group)?;
        }
        match self.store.get(value).cloned() {
            Some(Slot::Host(tensor)) => Ok(tensor),
            Some(Slot::Device(buffer)) => {
                let tensor = self
                    .host
                    .materialize(&buffer.to_literal())
                    .map_err(|err| tag(ExecutionErrorKind::Transfer(err.to_string())))?;
                self.store.insert(value, Slot::Host(tensor.clone()));
                Ok(tensor)
            }
            _ => Err(tag(ExecutionErrorKind::MissingValue(value))),
        }
    }

    /// Device view of `value`, uploading host tensors on demand.
    fn device_value(&mut self, value: ValueId, consumer: NodeId) -> Result<DeviceBuffer, ExecutionError> {
        if let Some(Slot::Pending { group, .. }) = self.store.get(value) {
            let group = *group;
            self.synchronize(group)?;
        }
        match self.store.get(value).cloned() {
            Some(Slot::Device(buffer)) => Ok(buffer),
            Some(Slot::Host(tensor)) => {
                let transfer = |message: String| {
                    ExecutionError::at(consumer, ExecutionErrorKind::Transfer(message))
                };
                let literal = self
                    .host
                    .to_literal(&tensor)
                    .map_err(|err| transfer(err.to_string()))?;
                DeviceBuffer::from_literal(&literal).map_err(|err| transfer(err.to_string()))
            }
            _ => Err(ExecutionError::at(
                consumer,
                ExecutionErrorKind::MissingValue(value),
            )),
        }
    }

    fn synchronize(&mut self, group: usize) -> Result<(), ExecutionError> {
        let Some((node, handle)) = self.pending.remove(&group) else {
            return Ok(());
        };
        let outputs = handle
            .synchronize()
            .map_err(|err| ExecutionError::at(node, ExecutionErrorKind::Engine(err)))?;
        for (value, index) in self.store.pending_in(group) {
            let buffer = outputs.get(index).cloned().ok_or_else(|| {
                ExecutionError::at(
                    node,
                    ExecutionErrorKind::Engine(EngineRuntimeError::new(format!(
                        "engine returned {} outputs, result {index} is missing",
                        outputs.len()
                    ))),
                )
            })?;
            if let Some(expected) = self.types.get(value) {
                if !spec_admits(expected, &buffer.spec()) {
                    return Err(ExecutionError::at(
                        node,
                        ExecutionErrorKind::Transfer(format!(
                            "engine result {value} is {}, expected {expected}",
                            buffer.spec()
                        )),
                    ));
                }
            }
            self.store.insert(value, Slot::Device(buffer));
        }
        debug!(node = %node, group, "synchronized engine");
        Ok(())
    }

    fn release_after(&mut self, position: usize, node: &Node) {
        for value in node.inputs.iter().chain(&node.outputs) {
            let last = self.last_use.get(value.0 as usize).copied().flatten();
            match last {
                Some(last) if last > position => {}
                Some(_) => self.store.release(*value),
                // produced but never read
                None if node.outputs.contains(value) => self.store.release(*value),
                None => {}
            }
        }
    }

    /// Waits for engine work whose results nobody read.
    fn drain(&mut self) -> Result<(), ExecutionError> {
        let mut groups = self.pending.keys().copied().collect::<Vec<_>>();
        groups.sort_unstable();
        for group in groups {
            self.synchronize(group)?;
        }
        Ok(())
    }
}
