pub mod classify;
pub mod compiler;
pub mod compose;
pub mod config;
pub mod convert;
pub mod engine;
mod env;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod lowering;
pub mod module;
pub mod partition;
pub mod propagate;
pub mod report;
pub mod runtime;
pub mod shape;

pub use classify::{Classification, FallbackReason};
pub use compiler::{compile, Compiler};
pub use config::{BuildFailurePolicy, CompileConfig};
pub use convert::ConverterRegistry;
pub use engine::{EngineRuntime, PrecisionMode};
pub use error::{CompileError, CompileResult};
pub use graph::{DType, Dimension, Graph, GraphBuilder, Shape, TensorLiteral, TensorSpec};
pub use module::{CompiledModule, IncompatibleArtifact, ModuleSerdeError};
pub use report::CompileReport;
pub use runtime::{ExecutionError, HostInterpreter, LoadedModule, ModuleState};
