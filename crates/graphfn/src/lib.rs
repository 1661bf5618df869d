pub(crate) mod autodiff;
pub mod backend;
pub mod cache;
pub mod defun;
pub mod dispatch;
mod env;
pub mod error;
pub mod function;
pub mod graph;
pub mod nest;
pub mod ops;
pub mod profiling;
pub mod tape;
pub mod tensor;

pub use backend::spec::{BackendError, DType, Dimension, PortableBackend, Shape, TensorSpec};
pub use defun::{args, defun, named_defun, with_options, Kwargs, TraceOptions, TracedFunction};
pub use dispatch::{Ambient, ExecutionMode};
pub use error::TraceError;
pub use graph::{GraphBuilder, TracedTensor};
pub use nest::{Nest, Structure};
pub use tape::GradientTape;
pub use tensor::{DeviceTensor, HostArray, Literal, TensorId, Value};
