//! Reference engine runtime. Plans are bincode-serialized network definitions
//! interpreted on the CPU with the host kernels; reduced precision rounds
//! every floating point layer result to f16.

mod exec;
mod plan;
mod runtime;

pub use exec::execute_plan;
pub use plan::{estimate_workspace, EnginePlan};
pub use runtime::{RefEngineRuntime, REF_ENGINE_NAME, REF_ENGINE_VERSION};
