//! Values flowing into and out of traced functions.
mod device;
mod value;

pub use device::{DeviceTensor, TensorId};
pub use value::{HostArray, Literal, Value};
