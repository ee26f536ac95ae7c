pub mod cpu;
pub mod kernels;

pub use cpu::{
    cast, literal_to_tensor, tensor_to_literal, CpuInterpreter, CpuKernelInterceptor, CpuTensor,
    GenericCpuInterpreter, NoopInterceptor, TensorData,
};
