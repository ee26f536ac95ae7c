use std::fmt;

use thiserror::Error;

use crate::graph::{NodeId, OpKind, ValueId};
use crate::partition::SegmentId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ShapeInferenceError {
    pub node: Option<NodeId>,
    pub value: Option<ValueId>,
    pub message: String,
}

impl ShapeInferenceError {
    pub fn at_node(node: NodeId, message: impl Into<String>) -> Self {
        Self {
            node: Some(node),
            value: None,
            message: message.into(),
        }
    }

    pub fn at_value(value: ValueId, message: impl Into<String>) -> Self {
        Self {
            node: None,
            value: Some(value),
            message: message.into(),
        }
    }
}

impl fmt::Display for ShapeInferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.node, self.value) {
            (Some(node), _) => write!(f, "shape inference failed at node {node}: {}", self.message),
            (None, Some(value)) => {
                write!(f, "shape inference failed for value {value}: {}", self.message)
            }
            (None, None) => write!(f, "shape inference failed: {}", self.message),
        }
    }
}

/// A segment whose engine could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine build failed for segment {segment} (nodes {nodes:?}): {message}")]
pub struct EngineBuildError {
    pub segment: SegmentId,
    pub nodes: Vec<NodeId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("composition failed: {message}")]
pub struct CompositionError {
    pub message: String,
}

impl CompositionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything that can stop a compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    ShapeInference(#[from] ShapeInferenceError),
    #[error("node {node} ({kind}) has an unsupported attribute: {detail}")]
    UnsupportedAttribute {
        node: NodeId,
        kind: OpKind,
        detail: String,
    },
    #[error("node {node}: no converter is registered for {kind}")]
    UnsupportedOperator { node: NodeId, kind: OpKind },
    #[error(transparent)]
    EngineBuild(#[from] EngineBuildError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error("invalid compile configuration: {0}")]
    InvalidConfig(String),
}

pub type CompileResult<T> = Result<T, CompileError>;
