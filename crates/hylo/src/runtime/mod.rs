//! Executes compiled modules: fallback nodes on a host interpreter, engine
//! calls on the engine runtime.

mod executor;
mod values;

use std::fmt;

use thiserror::Error;

use crate::engine::EngineRuntimeError;
use crate::graph::{Node, NodeId, TensorLiteral, TensorSpec, ValueId};
use crate::module::IncompatibleArtifact;

pub use executor::{LoadedModule, ModuleState};

/// Error raised by a host interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: String, reason: String },
    #[error("host execution failure: {message}")]
    Execution { message: String },
}

impl HostError {
    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        HostError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        HostError::Execution {
            message: message.into(),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Interpreter for nodes that stay on the host.
pub trait HostInterpreter: Send + Sync {
    type Tensor: Clone + Send + Sync + 'static;

    fn name(&self) -> &str;

    /// Creates a host tensor from a dense literal.
    fn materialize(&self, literal: &TensorLiteral) -> HostResult<Self::Tensor>;

    /// Reads a host tensor back as a dense literal.
    fn to_literal(&self, tensor: &Self::Tensor) -> HostResult<TensorLiteral>;

    /// Concrete spec of a host tensor.
    fn spec_of(&self, tensor: &Self::Tensor) -> TensorSpec;

    /// Runs one node. `outputs` carries the compiled result types, which may
    /// still contain dynamic extents.
    fn execute_node(
        &self,
        node: &Node,
        inputs: &[Self::Tensor],
        outputs: &[TensorSpec],
    ) -> HostResult<Vec<Self::Tensor>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    InputArity { expected: usize, found: usize },
    InputMismatch { index: usize, expected: TensorSpec, found: TensorSpec },
    NotReady(ModuleState),
    MissingValue(ValueId),
    Host(HostError),
    Engine(EngineRuntimeError),
    Incompatible(IncompatibleArtifact),
    Transfer(String),
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::InputArity { expected, found } => {
                write!(f, "expected {expected} inputs, got {found}")
            }
            ExecutionErrorKind::InputMismatch {
                index,
                expected,
                found,
            } => write!(f, "input {index} is {found}, expected {expected}"),
            ExecutionErrorKind::NotReady(state) => write!(f, "module is {state}"),
            ExecutionErrorKind::MissingValue(value) => write!(f, "value {value} is not available"),
            ExecutionErrorKind::Host(err) => write!(f, "{err}"),
            ExecutionErrorKind::Engine(err) => write!(f, "engine failure: {err}"),
            ExecutionErrorKind::Incompatible(err) => write!(f, "{err}"),
            ExecutionErrorKind::Transfer(message) => write!(f, "transfer failure: {message}"),
        }
    }
}

/// Failure while loading or running a module, tagged with the node involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ExecutionError {
    pub node: Option<NodeId>,
    pub kind: ExecutionErrorKind,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind) -> Self {
        Self { node: None, kind }
    }

    pub fn at(node: NodeId, kind: ExecutionErrorKind) -> Self {
        Self {
            node: Some(node),
            kind,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "execution failed at node {node}: {}", self.kind),
            None => write!(f, "execution failed: {}", self.kind),
        }
    }
}
