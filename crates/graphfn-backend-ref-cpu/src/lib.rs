//! Reference CPU interpreter for graphfn programs.
//!
//! Executes every operation of the function-definition format on host memory,
//! including nested `Call` instructions resolved against the program's function
//! list. Intended for tests and examples rather than performance.
pub mod cpu;

pub use cpu::{CpuPortableBackend, CpuTensor, TensorData};
